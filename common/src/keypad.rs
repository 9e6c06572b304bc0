use log::{debug, info, warn};

use crate::{
    command::{parse_token, Command, CommandTable},
    config::{BaseConfig, DeviceConfig},
    links::{ConfigStore, DeviceActions, Messaging, TimeSync, UpdateAgent},
    types::{is_keypad_key, DeviceStatus, ReadinessState, StateMessage},
};

/// Everything a collaborator can report to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    NetworkUp,
    NetworkDown,
    TimeReady,
    MessagingConnected,
    MessagingDisconnected,
    Message { topic: String, payload: Vec<u8> },
    NewFirmwareAvailable,
    KeyPressed(char),
}

pub struct Services {
    pub store: Box<dyn ConfigStore>,
    pub time_sync: Box<dyn TimeSync>,
    pub messaging: Box<dyn Messaging>,
    pub updates: Box<dyn UpdateAgent>,
    pub actions: Box<dyn DeviceActions>,
}

/// Lifecycle and control core of the keypad.
///
/// All state lives here and is only mutated from [`Keypad::handle`] (or the
/// individual `on_*` handlers) on the single control loop.
pub struct Keypad {
    config: DeviceConfig,
    readiness: ReadinessState,
    commands: CommandTable,
    services: Services,
    firmware_version: String,
    last_key: Option<char>,
    now_ms: u64,
    dispatching: bool,
    restarting: bool,
}

impl Keypad {
    pub fn new(config: DeviceConfig, services: Services) -> Self {
        info!(
            "keypad core ready: device=`{}`, state topic=`{}`, command topic=`{}`",
            config.device_id(),
            config.state_topic(),
            config.command_topic(),
        );
        Self {
            config,
            readiness: ReadinessState::default(),
            commands: CommandTable::default(),
            services,
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            last_key: None,
            now_ms: 0,
            dispatching: false,
            restarting: false,
        }
    }

    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_firmware_version(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = version.into();
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn readiness(&self) -> ReadinessState {
        self.readiness
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting
    }

    pub fn handle(&mut self, event: DeviceEvent, now_ms: u64) {
        self.now_ms = now_ms;

        if self.restarting {
            debug!("firmware apply in flight; dropping {event:?}");
            return;
        }

        match event {
            DeviceEvent::NetworkUp => self.on_network_up(),
            DeviceEvent::NetworkDown => self.on_network_down(),
            DeviceEvent::TimeReady => self.on_time_ready(),
            DeviceEvent::MessagingConnected => self.on_messaging_connected(),
            DeviceEvent::MessagingDisconnected => self.on_messaging_disconnected(),
            DeviceEvent::Message { topic, payload } => self.on_message(&topic, &payload),
            DeviceEvent::NewFirmwareAvailable => self.on_new_firmware_available(),
            DeviceEvent::KeyPressed(key) => self.on_key_pressed(key),
        }
    }

    pub fn on_network_up(&mut self) {
        if self.readiness.network_up {
            debug!("network already up");
            return;
        }

        self.readiness.network_up = true;
        info!("network up; starting time sync and messaging");

        if let Err(err) = self.services.time_sync.start() {
            warn!("time sync start failed: {err}");
        }
        if let Err(err) = self.services.messaging.connect() {
            warn!("messaging connect failed: {err}");
        }
    }

    pub fn on_network_down(&mut self) {
        let readiness = &self.readiness;
        if !(readiness.network_up || readiness.time_synced || readiness.messaging_connected) {
            debug!("network already down");
            return;
        }

        // A session accepted without NetworkUp is dropped here too.
        self.readiness.connectivity_lost();
        warn!("network down");
    }

    pub fn on_time_ready(&mut self) {
        if !self.readiness.network_up {
            debug!("ignoring time sync completion while network is down");
            return;
        }
        if self.readiness.time_synced {
            return;
        }

        self.readiness.time_synced = true;
        info!("time synchronized");
    }

    pub fn on_messaging_connected(&mut self) {
        if self.readiness.messaging_connected {
            debug!("messaging already connected");
            return;
        }

        self.readiness.messaging_connected = true;
        info!("messaging connected");

        let command_topic = self.config.command_topic();
        match self.services.messaging.subscribe(&command_topic) {
            Ok(()) => info!("subscribed to `{command_topic}`"),
            Err(err) => warn!("subscribe to `{command_topic}` failed: {err}"),
        }

        self.publish_state();
        self.poll_update_gate();
    }

    pub fn on_messaging_disconnected(&mut self) {
        if !self.readiness.messaging_connected {
            return;
        }

        self.readiness.messaging_connected = false;
        warn!("messaging disconnected");
    }

    /// Routes one inbound message. Anything that is not an exact command on the
    /// command topic is logged and dropped.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) {
        if topic != self.config.command_topic() {
            warn!("ignoring message on unexpected topic `{topic}`");
            return;
        }

        let token = match parse_token(payload) {
            Ok(token) => token,
            Err(err) => {
                warn!("dropping command on `{topic}`: {err}");
                return;
            }
        };

        let Some(command) = self.commands.lookup(token) else {
            warn!("unknown command `{token}`");
            return;
        };

        debug!("dispatching {command:?}");
        self.dispatching = true;
        self.execute(command);
        self.dispatching = false;

        self.poll_update_gate();
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::ReportState => {
                self.publish_state();
            }
            Command::CheckUpdate => match self.services.updates.check() {
                Ok(true) => self.on_new_firmware_available(),
                Ok(false) => info!("update check started; no firmware staged yet"),
                Err(err) => warn!("update check failed: {err}"),
            },
            Command::Device(action) => {
                if let Err(err) = self.services.actions.invoke(action) {
                    warn!("device action {action:?} failed: {err}");
                }
            }
        }
    }

    pub fn on_new_firmware_available(&mut self) {
        if self.restarting {
            return;
        }

        self.readiness.update_pending = true;
        info!("new firmware available");
        self.poll_update_gate();
    }

    pub fn on_key_pressed(&mut self, key: char) {
        if !is_keypad_key(key) {
            warn!("ignoring unknown key {key:?}");
            return;
        }

        self.last_key = Some(key);
        debug!("key `{key}` pressed");
        self.publish_state();
    }

    fn poll_update_gate(&mut self) {
        if !self.readiness.update_pending || self.restarting {
            return;
        }
        if self.dispatching {
            info!("deferring firmware apply until command dispatch completes");
            return;
        }
        if !self.readiness.messaging_connected {
            info!("deferring firmware apply until messaging reconnects");
            return;
        }

        self.apply_update();
    }

    fn apply_update(&mut self) {
        if !self.publish_state() {
            warn!("final state publish failed; applying firmware anyway");
        }

        match self.services.updates.apply() {
            Ok(()) => {
                info!("firmware apply handed off; waiting for restart");
                self.restarting = true;
            }
            Err(err) => {
                warn!("firmware apply rejected: {err}");
                self.readiness.update_pending = false;
            }
        }
    }

    pub fn state_message(&self) -> StateMessage {
        StateMessage {
            id: self.config.base.device.id.clone(),
            name: self.config.base.device.name.clone(),
            status: DeviceStatus {
                firmware: self.firmware_version.clone(),
                uptime_s: self.now_ms / 1_000,
                time_synced: self.readiness.time_synced,
                update_pending: self.readiness.update_pending,
                last_key: self.last_key,
            },
        }
    }

    /// Publishes the current state on the state topic. Returns whether the
    /// message was handed to the transport.
    pub fn publish_state(&mut self) -> bool {
        if !self.readiness.messaging_connected {
            debug!("messaging offline; state publish skipped");
            return false;
        }

        let body = match self.state_message().encode() {
            Ok(body) => body,
            Err(err) => {
                warn!("state message not published: {err}");
                return false;
            }
        };

        let topic = self.config.state_topic().as_str();
        match self.services.messaging.publish(topic, &body, true) {
            Ok(()) => true,
            Err(err) => {
                warn!("state publish to `{topic}` failed: {err}");
                false
            }
        }
    }

    /// Merges a partial configuration document over the running one, then
    /// validates and persists the result.
    ///
    /// Settings the document leaves out keep their current values. Unlike the
    /// boot-time load, a base setting of the wrong type rejects the whole
    /// update instead of falling back to its default.
    ///
    /// Returns `false` if the document is unreadable, carries a mistyped
    /// setting or could not be stored; the running configuration is then left
    /// untouched.
    pub fn update_config(&mut self, patch: &[u8]) -> bool {
        let document = match self.config.merge_document(patch) {
            Ok(document) => document,
            Err(err) => {
                warn!("config update rejected: {err}");
                return false;
            }
        };
        let base = match serde_json::from_slice::<BaseConfig>(&document) {
            Ok(base) => base,
            Err(err) => {
                warn!("config update rejected: {err}");
                return false;
            }
        };

        let mut candidate = DeviceConfig::from_base(base);
        if !candidate.parse_config(&document) {
            return false;
        }

        let stored = match candidate.to_document() {
            Ok(stored) => stored,
            Err(err) => {
                warn!("config update could not be serialized: {err}");
                return false;
            }
        };
        if let Err(err) = self.services.store.save(&stored) {
            warn!("config update not persisted: {err}");
            return false;
        }

        let restart_required = self.config.base.restart_required(&candidate.base);
        let topic_changed = self.config.state_topic() != candidate.state_topic();
        self.config = candidate;
        info!("config updated");

        if restart_required {
            warn!("connectivity settings changed; restart required to take effect");
        }
        if topic_changed {
            info!("state topic is now `{}`", self.config.state_topic());
            self.publish_state();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{command::DeviceAction, links::LinkError};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        TimeSyncStart,
        Connect,
        Subscribe(String),
        Publish(String, Vec<u8>),
        Check,
        Apply,
        Invoke(DeviceAction),
        Save(Vec<u8>),
    }

    type CallLog = Rc<RefCell<Vec<Call>>>;

    struct FakeStore {
        log: CallLog,
        stored: Option<Vec<u8>>,
        fail_save: bool,
    }

    impl ConfigStore for FakeStore {
        fn load(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
            Ok(self.stored.clone())
        }

        fn save(&mut self, document: &[u8]) -> Result<(), LinkError> {
            if self.fail_save {
                return Err(LinkError::failed("flash full"));
            }
            self.log.borrow_mut().push(Call::Save(document.to_vec()));
            self.stored = Some(document.to_vec());
            Ok(())
        }
    }

    struct FakeTimeSync(CallLog);

    impl TimeSync for FakeTimeSync {
        fn start(&mut self) -> Result<(), LinkError> {
            self.0.borrow_mut().push(Call::TimeSyncStart);
            Ok(())
        }
    }

    struct FakeMessaging {
        log: CallLog,
        fail_publish: bool,
    }

    impl Messaging for FakeMessaging {
        fn connect(&mut self) -> Result<(), LinkError> {
            self.log.borrow_mut().push(Call::Connect);
            Ok(())
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
            self.log.borrow_mut().push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
            assert!(retain);
            if self.fail_publish {
                return Err(LinkError::Busy);
            }
            self.log
                .borrow_mut()
                .push(Call::Publish(topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    struct FakeUpdates {
        log: CallLog,
        staged: bool,
        reject_apply: bool,
    }

    impl UpdateAgent for FakeUpdates {
        fn check(&mut self) -> Result<bool, LinkError> {
            self.log.borrow_mut().push(Call::Check);
            Ok(self.staged)
        }

        fn apply(&mut self) -> Result<(), LinkError> {
            self.log.borrow_mut().push(Call::Apply);
            if self.reject_apply {
                return Err(LinkError::failed("image corrupt"));
            }
            Ok(())
        }
    }

    struct FakeActions(CallLog);

    impl DeviceActions for FakeActions {
        fn invoke(&mut self, action: DeviceAction) -> Result<(), LinkError> {
            self.0.borrow_mut().push(Call::Invoke(action));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Setup {
        stored: Option<&'static str>,
        staged: bool,
        reject_apply: bool,
        fail_publish: bool,
        fail_save: bool,
    }

    impl Setup {
        fn boot(self) -> (Keypad, CallLog) {
            let log = CallLog::default();
            let mut services = Services {
                store: Box::new(FakeStore {
                    log: log.clone(),
                    stored: self.stored.map(|doc| doc.as_bytes().to_vec()),
                    fail_save: self.fail_save,
                }),
                time_sync: Box::new(FakeTimeSync(log.clone())),
                messaging: Box::new(FakeMessaging {
                    log: log.clone(),
                    fail_publish: self.fail_publish,
                }),
                updates: Box::new(FakeUpdates {
                    log: log.clone(),
                    staged: self.staged,
                    reject_apply: self.reject_apply,
                }),
                actions: Box::new(FakeActions(log.clone())),
            };
            let config = DeviceConfig::load_from(services.store.as_mut());
            let keypad = Keypad::new(config, services).with_firmware_version("1.2.3");
            (keypad, log)
        }
    }

    fn connected(setup: Setup) -> (Keypad, CallLog) {
        let (mut keypad, log) = setup.boot();
        keypad.handle(DeviceEvent::NetworkUp, 1_000);
        keypad.handle(DeviceEvent::MessagingConnected, 2_000);
        log.borrow_mut().clear();
        (keypad, log)
    }

    fn publishes(log: &CallLog) -> Vec<(String, StateMessage)> {
        log.borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Publish(topic, body) => {
                    Some((topic.clone(), StateMessage::decode(body).unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    fn command(payload: &str) -> DeviceEvent {
        DeviceEvent::Message {
            topic: "keypad/command".to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn empty_config_boot_publishes_once_on_default_topic() {
        let (mut keypad, log) = Setup::default().boot();

        keypad.handle(DeviceEvent::NetworkUp, 500);
        keypad.handle(DeviceEvent::MessagingConnected, 3_500);

        let calls = log.borrow().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], Call::TimeSyncStart);
        assert_eq!(calls[1], Call::Connect);
        assert_eq!(calls[2], Call::Subscribe("keypad/command".to_string()));

        let published = publishes(&log);
        assert_eq!(
            published,
            vec![(
                "keypad/state".to_string(),
                StateMessage {
                    id: "keypad".to_string(),
                    name: "Keypad".to_string(),
                    status: DeviceStatus {
                        firmware: "1.2.3".to_string(),
                        uptime_s: 3,
                        time_synced: false,
                        update_pending: false,
                        last_key: None,
                    },
                },
            )]
        );
    }

    #[test]
    fn stored_state_topic_is_used() {
        let (mut keypad, log) = Setup {
            stored: Some(r#"{"device":{"id":"porch"},"state_topic":"home/porch/keys"}"#),
            ..Setup::default()
        }
        .boot();

        keypad.handle(DeviceEvent::NetworkUp, 0);
        keypad.handle(DeviceEvent::MessagingConnected, 0);

        assert!(log
            .borrow()
            .contains(&Call::Subscribe("porch/command".to_string())));
        assert_eq!(publishes(&log)[0].0, "home/porch/keys");
    }

    #[test]
    fn time_sync_waits_for_network() {
        let (mut keypad, log) = Setup::default().boot();

        keypad.handle(DeviceEvent::TimeReady, 0);
        assert!(!keypad.readiness().time_synced);
        assert!(log.borrow().is_empty());

        keypad.handle(DeviceEvent::NetworkUp, 0);
        keypad.handle(DeviceEvent::NetworkUp, 0);
        keypad.handle(DeviceEvent::TimeReady, 0);
        assert!(keypad.readiness().time_synced);

        keypad.handle(DeviceEvent::NetworkDown, 0);
        keypad.handle(DeviceEvent::TimeReady, 0);
        assert!(!keypad.readiness().time_synced);

        keypad.handle(DeviceEvent::NetworkUp, 0);
        let starts = log
            .borrow()
            .iter()
            .filter(|call| **call == Call::TimeSyncStart)
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn no_transport_traffic_before_messaging_connects() {
        let (mut keypad, log) = Setup::default().boot();

        keypad.handle(DeviceEvent::KeyPressed('5'), 0);
        keypad.handle(command("state"), 0);
        keypad.handle(DeviceEvent::NetworkUp, 0);
        keypad.handle(DeviceEvent::KeyPressed('6'), 0);
        keypad.handle(command("state"), 0);

        assert_eq!(
            log.borrow().clone(),
            vec![Call::TimeSyncStart, Call::Connect]
        );

        keypad.handle(DeviceEvent::MessagingDisconnected, 0);
        keypad.handle(DeviceEvent::MessagingConnected, 0);
        keypad.handle(DeviceEvent::MessagingConnected, 0);
        let subscribes = log
            .borrow()
            .iter()
            .filter(|call| matches!(call, Call::Subscribe(_)))
            .count();
        assert_eq!(subscribes, 1);
        assert_eq!(publishes(&log).len(), 1);
    }

    #[test]
    fn messages_on_other_topics_change_nothing() {
        let (mut keypad, log) = connected(Setup::default());
        let before = keypad.readiness();

        for topic in ["keypad/state", "other/command", "keypad/command/extra"] {
            keypad.handle(
                DeviceEvent::Message {
                    topic: topic.to_string(),
                    payload: b"state".to_vec(),
                },
                5_000,
            );
        }

        assert!(log.borrow().is_empty());
        assert_eq!(keypad.readiness(), before);
    }

    #[test]
    fn unmatched_or_malformed_commands_are_dropped() {
        let (mut keypad, log) = connected(Setup::default());

        keypad.handle(command("State"), 0);
        keypad.handle(command(" state"), 0);
        keypad.handle(command(&"state".repeat(10)), 0);
        keypad.handle(
            DeviceEvent::Message {
                topic: "keypad/command".to_string(),
                payload: vec![0xc3, 0x28],
            },
            0,
        );

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn commands_reach_their_handlers() {
        let (mut keypad, log) = connected(Setup::default());

        keypad.handle(command("state"), 0);
        keypad.handle(command("identify"), 0);
        keypad.handle(command("restart"), 0);
        keypad.handle(command("update"), 0);

        let calls = log.borrow().clone();
        assert_eq!(calls.len(), 4);
        assert!(matches!(&calls[0], Call::Publish(topic, _) if topic == "keypad/state"));
        assert_eq!(calls[1], Call::Invoke(DeviceAction::Identify));
        assert_eq!(calls[2], Call::Invoke(DeviceAction::Restart));
        assert_eq!(calls[3], Call::Check);
        assert!(!keypad.readiness().update_pending);
    }

    #[test]
    fn injected_command_table_replaces_defaults() {
        let (keypad, log) = connected(Setup::default());
        let mut keypad = keypad.with_commands(
            CommandTable::empty().with("ping", Command::Device(DeviceAction::Identify)),
        );

        keypad.handle(command("state"), 0);
        keypad.handle(command("ping"), 0);

        assert_eq!(
            log.borrow().clone(),
            vec![Call::Invoke(DeviceAction::Identify)]
        );
    }

    #[test]
    fn firmware_found_mid_dispatch_applies_after_dispatch() {
        let (mut keypad, log) = connected(Setup {
            staged: true,
            ..Setup::default()
        });

        keypad.handle(command("update"), 0);

        let calls = log.borrow().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], Call::Check);
        assert!(matches!(&calls[1], Call::Publish(..)));
        assert_eq!(calls[2], Call::Apply);

        let (_, last_state) = publishes(&log).pop().unwrap();
        assert!(last_state.status.update_pending);
        assert!(keypad.is_restarting());
    }

    #[test]
    fn apply_waits_while_a_command_is_dispatching() {
        let (mut keypad, log) = connected(Setup::default());

        keypad.dispatching = true;
        keypad.on_new_firmware_available();
        assert!(keypad.readiness().update_pending);
        assert!(!log.borrow().contains(&Call::Apply));

        keypad.dispatching = false;
        keypad.handle(command("identify"), 0);

        let calls = log.borrow().clone();
        assert_eq!(calls[0], Call::Invoke(DeviceAction::Identify));
        assert_eq!(calls.last(), Some(&Call::Apply));
    }

    #[test]
    fn apply_waits_for_messaging_and_survives_network_loss() {
        let (mut keypad, log) = Setup::default().boot();

        keypad.handle(DeviceEvent::NewFirmwareAvailable, 0);
        keypad.handle(DeviceEvent::NetworkUp, 0);
        keypad.handle(DeviceEvent::NetworkDown, 0);
        assert!(keypad.readiness().update_pending);
        assert!(!log.borrow().contains(&Call::Apply));

        keypad.handle(DeviceEvent::NetworkUp, 0);
        keypad.handle(DeviceEvent::MessagingConnected, 0);
        assert_eq!(log.borrow().last(), Some(&Call::Apply));
        assert!(keypad.is_restarting());
    }

    #[test]
    fn failed_final_publish_does_not_block_apply() {
        let (mut keypad, log) = connected(Setup {
            fail_publish: true,
            ..Setup::default()
        });

        keypad.handle(DeviceEvent::NewFirmwareAvailable, 0);

        assert_eq!(log.borrow().clone(), vec![Call::Apply]);
    }

    #[test]
    fn rejected_apply_clears_pending_flag() {
        let (mut keypad, log) = connected(Setup {
            reject_apply: true,
            ..Setup::default()
        });

        keypad.handle(DeviceEvent::NewFirmwareAvailable, 0);
        assert!(!keypad.readiness().update_pending);
        assert!(!keypad.is_restarting());

        keypad.handle(command("identify"), 0);
        let applies = log
            .borrow()
            .iter()
            .filter(|call| **call == Call::Apply)
            .count();
        assert_eq!(applies, 1);
    }

    #[test]
    fn events_after_apply_are_ignored() {
        let (mut keypad, log) = connected(Setup::default());

        keypad.handle(DeviceEvent::NewFirmwareAvailable, 0);
        log.borrow_mut().clear();

        keypad.handle(command("state"), 0);
        keypad.handle(DeviceEvent::KeyPressed('1'), 0);
        keypad.handle(DeviceEvent::NetworkDown, 0);

        assert!(log.borrow().is_empty());
        assert!(keypad.readiness().network_up);
    }

    #[test]
    fn key_presses_publish_state() {
        let (mut keypad, log) = connected(Setup::default());

        keypad.handle(DeviceEvent::KeyPressed('#'), 0);
        keypad.handle(DeviceEvent::KeyPressed('x'), 0);

        let published = publishes(&log);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.status.last_key, Some('#'));
    }

    #[test]
    fn config_update_persists_and_moves_state_topic() {
        let (mut keypad, log) = connected(Setup::default());

        assert!(keypad.update_config(br#"{"device":{"name":"Hall"},"state_topic":"hall/keys"}"#));

        let calls = log.borrow().clone();
        assert!(matches!(&calls[0], Call::Save(_)));
        let published = publishes(&log);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "hall/keys");
        assert_eq!(published[0].1.name, "Hall");
        assert_eq!(keypad.config().state_topic().as_str(), "hall/keys");
    }

    #[test]
    fn config_update_with_bad_topic_still_succeeds() {
        let (mut keypad, _log) = connected(Setup::default());
        let long = "t".repeat(200);
        let document = serde_json::json!({ "state_topic": long }).to_string();

        assert!(keypad.update_config(document.as_bytes()));
        assert_eq!(keypad.config().state_topic().as_str(), "keypad/state");
    }

    #[test]
    fn rejected_config_update_leaves_running_config() {
        let (mut keypad, log) = connected(Setup {
            fail_save: true,
            ..Setup::default()
        });
        let before = keypad.config().clone();

        assert!(!keypad.update_config(b"definitely not json"));
        assert!(!keypad.update_config(br#"{"state_topic":"moved/state"}"#));

        assert_eq!(keypad.config(), &before);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn network_loss_drops_a_session_accepted_without_network_up() {
        let (mut keypad, log) = Setup::default().boot();

        keypad.handle(DeviceEvent::MessagingConnected, 0);
        assert!(keypad.readiness().messaging_connected);
        keypad.handle(DeviceEvent::NetworkDown, 10);

        let readiness = keypad.readiness();
        assert!(!readiness.network_up);
        assert!(!readiness.messaging_connected);

        log.borrow_mut().clear();
        keypad.handle(DeviceEvent::KeyPressed('1'), 20);
        assert!(publishes(&log).is_empty());
    }

    #[test]
    fn messaging_reconnect_resubscribes_and_republishes() {
        let (mut keypad, log) = connected(Setup::default());

        keypad.handle(DeviceEvent::MessagingDisconnected, 3_000);
        assert!(!keypad.readiness().messaging_connected);
        keypad.handle(DeviceEvent::KeyPressed('4'), 3_500);
        assert!(log.borrow().is_empty());

        keypad.handle(DeviceEvent::MessagingConnected, 4_000);

        assert!(keypad.readiness().messaging_connected);
        let calls = log.borrow().clone();
        assert_eq!(calls[0], Call::Subscribe("keypad/command".to_string()));
        let published = publishes(&log);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "keypad/state");
    }

    #[test]
    fn topic_only_update_keeps_identity_and_network() {
        let (mut keypad, log) = connected(Setup {
            stored: Some(
                r#"{"device":{"id":"porch"},"network":{"mqtt_host":"broker.lan","wifi_ssid":"home","wifi_pass":"secret","mqtt_pass":"hunter2"}}"#,
            ),
            ..Setup::default()
        });

        assert!(keypad.update_config(br#"{"state_topic":"porch/keys"}"#));

        let config = keypad.config();
        assert_eq!(config.device_id(), "porch");
        assert_eq!(config.base.network.mqtt_host, "broker.lan");
        assert_eq!(config.base.network.wifi_ssid, "home");
        assert_eq!(config.base.network.wifi_pass, "secret");
        assert_eq!(config.base.network.mqtt_pass, "hunter2");
        assert_eq!(config.state_topic().as_str(), "porch/keys");

        let saved = log
            .borrow()
            .iter()
            .find_map(|call| match call {
                Call::Save(document) => Some(document.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(&DeviceConfig::load(&saved), config);
    }

    #[test]
    fn restart_command_does_not_apply_staged_firmware() {
        let (mut keypad, log) = connected(Setup {
            staged: true,
            ..Setup::default()
        });

        keypad.handle(command("restart"), 0);

        assert_eq!(
            log.borrow().clone(),
            vec![Call::Invoke(DeviceAction::Restart)]
        );
        assert!(!keypad.is_restarting());
        assert!(!keypad.readiness().update_pending);
    }

    #[test]
    fn mistyped_setting_rejects_the_update() {
        let (mut keypad, log) = connected(Setup::default());
        let before = keypad.config().clone();

        assert!(!keypad.update_config(
            br#"{"network":{"mqtt_port":"x"},"state_topic":"moved/state"}"#
        ));
        assert!(!keypad.update_config(br#"["state_topic"]"#));

        assert_eq!(keypad.config(), &before);
        assert!(log.borrow().is_empty());
    }
}
