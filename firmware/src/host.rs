use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{mpsc, oneshot, watch, Notify},
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use keypad_common::{
    ConfigStore, DeviceAction, DeviceActions, DeviceConfig, DeviceEvent, DeviceIdentity, Keypad,
    LinkError, Messaging, NetworkConfig, ReadinessState, Services, StateMessage, TimeSync,
    UpdateAgent,
};

use crate::support::{digest_matches, monotonic_ms, sha256_hex};

const MQTT_RETRY_DELAY: Duration = Duration::from_secs(2);
const NETWORK_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const CLOCK_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const STAGING_SCAN_INTERVAL: Duration = Duration::from_secs(30);
const FIRMWARE_IMAGE: &str = "firmware.bin";
// 2020-01-01T00:00:00Z
const MIN_PLAUSIBLE_EPOCH: i64 = 1_577_836_800;

enum HostEvent {
    Device(DeviceEvent),
    Status(oneshot::Sender<StatusView>),
    ReadConfig(oneshot::Sender<ConfigView>),
    UpdateConfig {
        document: Vec<u8>,
        reply: oneshot::Sender<Option<ConfigView>>,
    },
}

type EventSender = mpsc::UnboundedSender<HostEvent>;

#[derive(Debug, Clone)]
struct BrokerAddress {
    host: String,
    port: u16,
}

struct FileStore {
    path: PathBuf,
}

struct MqttLink {
    client: AsyncClient,
    enabled: watch::Sender<bool>,
    session_up: Arc<AtomicBool>,
    events: EventSender,
}

struct ClockSync {
    events: EventSender,
}

#[derive(Clone)]
struct StagingAgent {
    staging_dir: PathBuf,
    active_dir: PathBuf,
    events: EventSender,
    restart: Arc<Notify>,
}

struct StagedImage {
    path: PathBuf,
    digest: String,
}

struct HostActions {
    restart: Arc<Notify>,
}

#[derive(Clone)]
struct HttpState {
    events: EventSender,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    readiness: ReadinessState,
    state: StateMessage,
    #[serde(rename = "stateTopic")]
    state_topic: String,
    #[serde(rename = "commandTopic")]
    command_topic: String,
    #[serde(rename = "localTime")]
    local_time: Option<String>,
    restarting: bool,
}

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    device: DeviceIdentity,
    network: NetworkConfigView,
    timezone: String,
    #[serde(rename = "updateManifestUrl")]
    update_manifest_url: String,
    #[serde(rename = "stateTopic")]
    state_topic: String,
}

pub async fn run() -> anyhow::Result<()> {
    setup_logging();

    let data_dir = std::env::var("KEYPAD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.keypad"));
    let (events, mut inbox) = mpsc::unbounded_channel();
    let restart = Arc::new(Notify::new());

    let (store, config) = setup_config(&data_dir);
    let broker = broker_address(&config.base.network);

    let messaging = setup_messaging(&config, &broker, events.clone());
    let time_sync = setup_time_sync(events.clone());
    let updates = setup_updates(&data_dir, events.clone(), restart.clone());
    setup_network(broker, events.clone());
    setup_keys(events.clone());
    setup_http(events.clone()).await?;

    let services = Services {
        store: Box::new(store),
        time_sync: Box::new(time_sync),
        messaging: Box::new(messaging),
        updates: Box::new(updates),
        actions: Box::new(HostActions {
            restart: restart.clone(),
        }),
    };
    let mut keypad = Keypad::new(config, services).with_firmware_version(env!("CARGO_PKG_VERSION"));

    loop {
        tokio::select! {
            event = inbox.recv() => {
                let Some(event) = event else { break };
                handle_host_event(&mut keypad, event);
            }
            _ = restart.notified() => {
                info!("restart requested; exiting for relaunch");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

fn handle_host_event(keypad: &mut Keypad, event: HostEvent) {
    match event {
        HostEvent::Device(event) => keypad.handle(event, monotonic_ms()),
        HostEvent::Status(reply) => {
            let _ = reply.send(build_status_view(keypad));
        }
        HostEvent::ReadConfig(reply) => {
            let _ = reply.send(build_config_view(keypad.config()));
        }
        HostEvent::UpdateConfig { document, reply } => {
            let accepted = keypad.update_config(&document);
            let _ = reply.send(accepted.then(|| build_config_view(keypad.config())));
        }
    }
}

fn emit(events: &EventSender, event: DeviceEvent) {
    if events.send(HostEvent::Device(event)).is_err() {
        debug!("control loop stopped; device event dropped");
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn setup_config(data_dir: &Path) -> (FileStore, DeviceConfig) {
    let mut store = FileStore {
        path: data_dir.join("config.json"),
    };
    let config = DeviceConfig::load_from(&mut store);

    if config.base.timezone.parse::<Tz>().is_err() {
        warn!(
            "configured timezone `{}` is unknown; local time disabled",
            config.base.timezone
        );
    }
    info!(
        "config loaded from {}: device=`{}`, mqtt=`{}:{}`",
        store.path.display(),
        config.device_id(),
        config.base.network.mqtt_host,
        config.base.network.mqtt_port,
    );

    (store, config)
}

fn broker_address(network: &NetworkConfig) -> BrokerAddress {
    BrokerAddress {
        host: std::env::var("MQTT_HOST").unwrap_or_else(|_| network.mqtt_host.clone()),
        port: std::env::var("MQTT_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(network.mqtt_port),
    }
}

fn setup_messaging(config: &DeviceConfig, broker: &BrokerAddress, events: EventSender) -> MqttLink {
    let network = &config.base.network;
    let mut mqtt_options = MqttOptions::new(config.device_id(), broker.host.clone(), broker.port);
    mqtt_options.set_keep_alive(Duration::from_secs(15));

    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (client, eventloop) = AsyncClient::new(mqtt_options, 64);
    let (enabled, enabled_rx) = watch::channel(false);
    let session_up = Arc::new(AtomicBool::new(false));

    spawn_mqtt_loop(eventloop, enabled_rx, session_up.clone(), events.clone());

    MqttLink {
        client,
        enabled,
        session_up,
        events,
    }
}

fn spawn_mqtt_loop(
    mut eventloop: EventLoop,
    mut enabled: watch::Receiver<bool>,
    session_up: Arc<AtomicBool>,
    events: EventSender,
) {
    tokio::spawn(async move {
        if enabled.wait_for(|on| *on).await.is_err() {
            return;
        }
        info!("mqtt connection attempts started");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    session_up.store(true, Ordering::Relaxed);
                    emit(&events, DeviceEvent::MessagingConnected);
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    emit(
                        &events,
                        DeviceEvent::Message {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        },
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    if session_up.swap(false, Ordering::Relaxed) {
                        emit(&events, DeviceEvent::MessagingDisconnected);
                    }
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(MQTT_RETRY_DELAY).await;
                }
            }
        }
    });
}

impl Messaging for MqttLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.enabled.send_replace(true);
        // The transport may have stayed up across a network blip.
        if self.session_up.load(Ordering::Relaxed) {
            emit(&self.events, DeviceEvent::MessagingConnected);
        }
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(LinkError::failed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(LinkError::failed)
    }
}

fn setup_network(broker: BrokerAddress, events: EventSender) {
    tokio::spawn(async move {
        let mut up = false;
        let mut interval = tokio::time::interval(NETWORK_PROBE_INTERVAL);

        loop {
            interval.tick().await;
            let reachable = match tokio::net::lookup_host((broker.host.as_str(), broker.port)).await
            {
                Ok(mut addrs) => addrs.next().is_some(),
                Err(err) => {
                    if up {
                        warn!("broker `{}` no longer resolves: {err}", broker.host);
                    }
                    false
                }
            };

            if reachable != up {
                up = reachable;
                emit(
                    &events,
                    if up {
                        DeviceEvent::NetworkUp
                    } else {
                        DeviceEvent::NetworkDown
                    },
                );
            }
        }
    });
}

fn setup_time_sync(events: EventSender) -> ClockSync {
    ClockSync { events }
}

impl TimeSync for ClockSync {
    fn start(&mut self) -> Result<(), LinkError> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLOCK_PROBE_INTERVAL);
            loop {
                interval.tick().await;
                if clock_is_plausible(Utc::now().timestamp()) {
                    emit(&events, DeviceEvent::TimeReady);
                    break;
                }
            }
        });
        Ok(())
    }
}

fn clock_is_plausible(epoch: i64) -> bool {
    epoch >= MIN_PLAUSIBLE_EPOCH
}

fn setup_updates(data_dir: &Path, events: EventSender, restart: Arc<Notify>) -> StagingAgent {
    let agent = StagingAgent {
        staging_dir: data_dir.join("staging"),
        active_dir: data_dir.join("active"),
        events,
        restart,
    };
    spawn_staging_watch(agent.clone());
    agent
}

fn spawn_staging_watch(agent: StagingAgent) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STAGING_SCAN_INTERVAL);
        let mut announced: Option<String> = None;

        loop {
            interval.tick().await;
            match agent.staged_image() {
                Ok(Some(image)) if announced.as_deref() != Some(image.digest.as_str()) => {
                    info!("staged firmware {} found", image.digest);
                    emit(&agent.events, DeviceEvent::NewFirmwareAvailable);
                    announced = Some(image.digest);
                }
                Ok(_) => {}
                Err(err) => warn!("staged firmware unusable: {err:#}"),
            }
        }
    });
}

impl StagingAgent {
    fn staged_image(&self) -> anyhow::Result<Option<StagedImage>> {
        let path = self.staging_dir.join(FIRMWARE_IMAGE);
        let image = match std::fs::read(&path) {
            Ok(image) => image,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let expected = std::fs::read_to_string(digest_path(&path))
            .with_context(|| format!("missing digest for {}", path.display()))?;
        let digest = sha256_hex(&image);
        if !digest_matches(&expected, &digest) {
            anyhow::bail!(
                "sha256 mismatch (expected {}, got {digest})",
                expected.trim()
            );
        }

        Ok(Some(StagedImage { path, digest }))
    }

    fn activate(&self, image: &StagedImage) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.active_dir)
            .with_context(|| format!("failed to create {}", self.active_dir.display()))?;

        let target = self.active_dir.join(FIRMWARE_IMAGE);
        std::fs::rename(&image.path, &target).context("failed to move staged image")?;
        std::fs::write(digest_path(&target), &image.digest)?;
        let _ = std::fs::remove_file(digest_path(&image.path));
        Ok(())
    }
}

impl UpdateAgent for StagingAgent {
    fn check(&mut self) -> Result<bool, LinkError> {
        self.staged_image()
            .map(|image| image.is_some())
            .map_err(|err| LinkError::failed(format!("{err:#}")))
    }

    fn apply(&mut self) -> Result<(), LinkError> {
        let image = self
            .staged_image()
            .map_err(|err| LinkError::failed(format!("{err:#}")))?
            .ok_or_else(|| LinkError::failed("no staged firmware image"))?;
        self.activate(&image)
            .map_err(|err| LinkError::failed(format!("{err:#}")))?;

        info!("firmware {} activated", image.digest);
        self.restart.notify_one();
        Ok(())
    }
}

fn digest_path(image: &Path) -> PathBuf {
    image.with_extension("bin.sha256")
}

impl DeviceActions for HostActions {
    fn invoke(&mut self, action: DeviceAction) -> Result<(), LinkError> {
        match action {
            DeviceAction::Restart => {
                info!("restart command received");
                self.restart.notify_one();
            }
            DeviceAction::Identify => info!("identify: flashing status indicator"),
        }
        Ok(())
    }
}

fn setup_keys(events: EventSender) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    for key in line.chars().filter(|c| !c.is_whitespace()) {
                        emit(&events, DeviceEvent::KeyPressed(key.to_ascii_uppercase()));
                    }
                }
                Ok(None) => {
                    info!("stdin closed; key input disabled");
                    break;
                }
                Err(err) => {
                    warn!("stdin read failed: {err}");
                    break;
                }
            }
        }
    });
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LinkError::failed(err)),
        }
    }

    fn save(&mut self, document: &[u8]) -> Result<(), LinkError> {
        write_atomic(&self.path, document).map_err(|err| LinkError::failed(format!("{err:#}")))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, bytes)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn validate_timezone(document: &[u8]) -> Result<(), String> {
    let Ok(value) = serde_json::from_slice::<Value>(document) else {
        return Ok(());
    };
    match value.get("timezone").and_then(Value::as_str) {
        Some(timezone) if timezone.parse::<Tz>().is_err() => {
            Err(format!("unknown timezone `{timezone}`"))
        }
        _ => Ok(()),
    }
}

async fn setup_http(events: EventSender) -> anyhow::Result<()> {
    let port = std::env::var("KEYPAD_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .with_state(HttpState { events });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind diagnostics server at {addr}"))?;
    info!("diagnostics listening on http://{addr}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("diagnostics server stopped: {err}");
        }
    });
    Ok(())
}

async fn ask<T>(
    events: &EventSender,
    request: impl FnOnce(oneshot::Sender<T>) -> HostEvent,
) -> Option<T> {
    let (reply, response) = oneshot::channel();
    events.send(request(reply)).ok()?;
    response.await.ok()
}

async fn handle_get_status(State(state): State<HttpState>) -> axum::response::Response {
    match ask(&state.events, HostEvent::Status).await {
        Some(view) => Json(view).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped"),
    }
}

async fn handle_get_config(State(state): State<HttpState>) -> axum::response::Response {
    match ask(&state.events, HostEvent::ReadConfig).await {
        Some(view) => Json(view).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped"),
    }
}

async fn handle_put_config(State(state): State<HttpState>, body: Bytes) -> axum::response::Response {
    if let Err(message) = validate_timezone(&body) {
        return error_response(StatusCode::BAD_REQUEST, &message);
    }

    let document = body.to_vec();
    match ask(&state.events, |reply| HostEvent::UpdateConfig { document, reply }).await {
        Some(Some(view)) => Json(view).into_response(),
        Some(None) => error_response(StatusCode::BAD_REQUEST, "config document rejected"),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped"),
    }
}

fn build_status_view(keypad: &Keypad) -> StatusView {
    let readiness = keypad.readiness();
    let config = keypad.config();
    StatusView {
        readiness,
        state: keypad.state_message(),
        state_topic: config.state_topic().to_string(),
        command_topic: config.command_topic(),
        local_time: readiness
            .time_synced
            .then(|| now_in_timezone(&config.base.timezone))
            .flatten()
            .map(|now| now.to_rfc3339()),
        restarting: keypad.is_restarting(),
    }
}

fn build_config_view(config: &DeviceConfig) -> ConfigView {
    let network = &config.base.network;
    ConfigView {
        device: config.base.device.clone(),
        network: NetworkConfigView {
            wifi_ssid: network.wifi_ssid.clone(),
            wifi_pass_set: !network.wifi_pass.is_empty(),
            mqtt_host: network.mqtt_host.clone(),
            mqtt_port: network.mqtt_port,
            mqtt_user: network.mqtt_user.clone(),
            mqtt_pass_set: !network.mqtt_pass.is_empty(),
        },
        timezone: config.base.timezone.clone(),
        update_manifest_url: config.base.update.manifest_url.clone(),
        state_topic: config.state_topic().to_string(),
    }
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
