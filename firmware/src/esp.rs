use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use keypad_common::{
    key_at, ConfigStore, DeviceAction, DeviceActions, DeviceConfig, DeviceEvent, KeyDebouncer,
    Keypad, LinkError, Messaging, NetworkConfig, Services, TimeSync, UpdateAgent, MATRIX_COLS,
    MATRIX_ROWS,
};

use crate::support::{digest_matches, monotonic_ms, to_hex};

const NVS_NAMESPACE: &str = "keypad";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_BYTES: usize = 2048;
const OTA_CHUNK_SIZE: usize = 4096;
const MAX_MANIFEST_BYTES: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECONNECT_INTERVAL: Duration = Duration::from_secs(15);
const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SNTP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
const CONTROL_TICK: Duration = Duration::from_millis(500);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const KEY_SCAN_INTERVAL: Duration = Duration::from_millis(10);
const ROW_PINS: [i32; MATRIX_ROWS] = [13, 12, 14, 27];
const COL_PINS: [i32; MATRIX_COLS] = [26, 25, 33, 32];
const STATUS_LED_PIN: i32 = 2;
const IDENTIFY_BLINKS: u32 = 5;
const IDENTIFY_BLINK: Duration = Duration::from_millis(150);

type StatusLed = PinDriver<'static, AnyOutputPin, Output>;
type RowPin = PinDriver<'static, AnyOutputPin, Output>;
type ColPin = PinDriver<'static, AnyInputPin, Input>;

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

struct SntpSync {
    requests: Option<Sender<()>>,
    events: Sender<DeviceEvent>,
}

struct MqttLink {
    url: String,
    client_id: String,
    user: String,
    pass: String,
    client: Option<EspMqttClient<'static>>,
    session_up: Arc<AtomicBool>,
    events: Sender<DeviceEvent>,
}

#[derive(Debug, Deserialize)]
struct UpdateManifest {
    version: String,
    url: String,
    sha256: String,
}

#[derive(Clone)]
struct OtaWorker {
    manifest_url: String,
    firmware_version: String,
    events: Sender<DeviceEvent>,
    staged: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
}

struct OtaAgent {
    worker: OtaWorker,
}

struct EspActions {
    led: Option<Arc<Mutex<StatusLed>>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut config = DeviceConfig::load_from(&mut store);
    ensure_wifi_defaults(&mut config.base.network);

    info!(
        "NVS config loaded: device=`{}`, ssid=`{}`, mqtt=`{}:{}`",
        config.device_id(),
        config.base.network.wifi_ssid,
        config.base.network.mqtt_host,
        config.base.network.mqtt_port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.base.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;
    mark_running_slot_valid();

    let (events, inbox) = mpsc::channel();
    let reconnect = has_station_credentials(&config.base.network);
    spawn_network_monitor(wifi, reconnect, events.clone())?;
    if let Err(err) = spawn_key_scanner(events.clone()) {
        warn!("keypad matrix unavailable, running without keys: {err:#}");
    }

    let updates = OtaAgent::new(&config, env!("CARGO_PKG_VERSION"), events.clone());
    updates.spawn_periodic_check()?;

    let services = Services {
        store: Box::new(store),
        time_sync: Box::new(SntpSync {
            requests: None,
            events: events.clone(),
        }),
        messaging: Box::new(MqttLink::new(&config, events.clone())),
        updates: Box::new(updates),
        actions: Box::new(EspActions {
            led: init_status_led(STATUS_LED_PIN).map(|led| Arc::new(Mutex::new(led))),
        }),
    };
    let mut keypad = Keypad::new(config, services).with_firmware_version(env!("CARGO_PKG_VERSION"));

    loop {
        feed_watchdog();
        match inbox.recv_timeout(CONTROL_TICK) {
            Ok(event) => keypad.handle(event, monotonic_ms()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(anyhow!("event channel closed")),
        }
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

impl ConfigStore for NvsStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(LinkError::failed)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];

        let document = nvs
            .get_str(NVS_CONFIG_KEY, &mut buffer)
            .map_err(LinkError::failed)?;
        Ok(document.map(|value| value.as_bytes().to_vec()))
    }

    fn save(&mut self, document: &[u8]) -> Result<(), LinkError> {
        if document.len() >= NVS_BUFFER_BYTES {
            return Err(LinkError::failed(format!(
                "config document is {} bytes, limit is {}",
                document.len(),
                NVS_BUFFER_BYTES - 1
            )));
        }
        let document = core::str::from_utf8(document).map_err(LinkError::failed)?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(LinkError::failed)?;
        nvs.set_str(NVS_CONFIG_KEY, document)
            .map_err(LinkError::failed)
    }
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    !network.wifi_ssid.trim().is_empty()
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; staying offline");
        return Ok(esp_wifi);
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                break;
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        } else {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; retrying in background");
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn spawn_network_monitor(
    mut wifi: EspWifi<'static>,
    reconnect: bool,
    events: Sender<DeviceEvent>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("net-monitor".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            let mut up = false;
            let mut since_attempt = Duration::ZERO;

            loop {
                let connected = wifi.is_up().unwrap_or(false);
                if connected != up {
                    up = connected;
                    let event = if up {
                        info!("wifi link up");
                        DeviceEvent::NetworkUp
                    } else {
                        warn!("wifi link lost");
                        DeviceEvent::NetworkDown
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                    since_attempt = Duration::ZERO;
                }

                if !up && reconnect {
                    since_attempt += NETWORK_POLL_INTERVAL;
                    if since_attempt >= WIFI_RECONNECT_INTERVAL {
                        since_attempt = Duration::ZERO;
                        if let Err(err) = wifi.connect() {
                            warn!("wifi reconnect failed: {err}");
                        }
                    }
                }

                thread::sleep(NETWORK_POLL_INTERVAL);
            }
        })?;
    Ok(())
}

impl TimeSync for SntpSync {
    fn start(&mut self) -> Result<(), LinkError> {
        if self.requests.is_none() {
            self.requests = Some(spawn_sntp_worker(self.events.clone()).map_err(LinkError::failed)?);
        }

        let Some(requests) = self.requests.as_ref() else {
            return Err(LinkError::NotConnected);
        };
        if requests.send(()).is_err() {
            self.requests = None;
            return Err(LinkError::failed("sntp worker stopped"));
        }
        Ok(())
    }
}

/// The worker owns the SNTP service and answers each request with a
/// time-ready event once the clock has synchronized.
fn spawn_sntp_worker(events: Sender<DeviceEvent>) -> std::io::Result<Sender<()>> {
    let (requests, pending) = mpsc::channel::<()>();

    thread::Builder::new()
        .name("sntp".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut sntp: Option<EspSntp<'static>> = None;

            for () in pending.iter() {
                if sntp.is_none() {
                    match EspSntp::new_default() {
                        Ok(service) => {
                            info!("SNTP initialized");
                            sntp = Some(service);
                        }
                        Err(err) => {
                            warn!("failed to start SNTP: {err}");
                            continue;
                        }
                    }
                }

                let Some(service) = sntp.as_ref() else {
                    continue;
                };
                while !matches!(service.get_sync_status(), SyncStatus::Completed) {
                    thread::sleep(SNTP_POLL_INTERVAL);
                }
                if events.send(DeviceEvent::TimeReady).is_err() {
                    break;
                }
            }
        })?;

    Ok(requests)
}

impl MqttLink {
    fn new(config: &DeviceConfig, events: Sender<DeviceEvent>) -> Self {
        let network = &config.base.network;
        Self {
            url: format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port),
            client_id: config.device_id().to_string(),
            user: network.mqtt_user.clone(),
            pass: network.mqtt_pass.clone(),
            client: None,
            session_up: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, LinkError> {
        self.client.as_mut().ok_or(LinkError::NotConnected)
    }
}

impl Messaging for MqttLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        if self.client.is_some() {
            // The client reconnects on its own; only replay a live session.
            if self.session_up.load(Ordering::Relaxed) {
                let _ = self.events.send(DeviceEvent::MessagingConnected);
            }
            return Ok(());
        }

        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id.as_str()),
            username: (!self.user.is_empty()).then_some(self.user.as_str()),
            password: (!self.pass.is_empty()).then_some(self.pass.as_str()),
            ..Default::default()
        };

        let (client, conn) =
            EspMqttClient::new(self.url.as_str(), &conf).map_err(LinkError::failed)?;
        spawn_mqtt_receiver(conn, self.session_up.clone(), self.events.clone())
            .map_err(LinkError::failed)?;
        self.client = Some(client);
        info!("mqtt client started for {}", self.url);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(LinkError::failed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        self.client()?
            .enqueue(topic, QoS::AtLeastOnce, retain, payload)
            .map(|_| ())
            .map_err(LinkError::failed)
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    session_up: Arc<AtomicBool>,
    events: Sender<DeviceEvent>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt connection closed: {err:?}");
                    break;
                }
            };

            let forwarded = match event.payload() {
                EventPayload::Connected(_) => {
                    session_up.store(true, Ordering::Relaxed);
                    Some(DeviceEvent::MessagingConnected)
                }
                EventPayload::Disconnected => session_up
                    .swap(false, Ordering::Relaxed)
                    .then_some(DeviceEvent::MessagingDisconnected),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details,
                    ..
                } => {
                    // We only process full MQTT payloads.
                    if !matches!(details, Details::Complete) {
                        None
                    } else if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        None
                    } else {
                        Some(DeviceEvent::Message {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        })
                    }
                }
                _ => None,
            };

            if let Some(event) = forwarded {
                if events.send(event).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

impl OtaAgent {
    fn new(config: &DeviceConfig, firmware_version: &str, events: Sender<DeviceEvent>) -> Self {
        Self {
            worker: OtaWorker {
                manifest_url: config.base.update.manifest_url.clone(),
                firmware_version: firmware_version.to_string(),
                events,
                staged: Arc::new(AtomicBool::new(false)),
                busy: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    fn spawn_periodic_check(&self) -> anyhow::Result<()> {
        if self.worker.manifest_url.is_empty() {
            info!("no update manifest configured; periodic update checks disabled");
            return Ok(());
        }

        let worker = self.worker.clone();
        thread::Builder::new()
            .name("ota-poll".into())
            .stack_size(4 * 1024)
            .spawn(move || loop {
                thread::sleep(UPDATE_CHECK_INTERVAL);
                if worker.staged.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(err) = worker.spawn_check() {
                    warn!("periodic update check skipped: {err}");
                }
            })?;
        Ok(())
    }
}

impl OtaWorker {
    fn spawn_check(&self) -> Result<(), LinkError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(LinkError::Busy);
        }

        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name("ota-check".into())
            .stack_size(12 * 1024)
            .spawn(move || {
                worker.run_check();
                worker.busy.store(false, Ordering::Release);
            });

        if let Err(err) = spawned {
            self.busy.store(false, Ordering::Release);
            return Err(LinkError::failed(err));
        }
        Ok(())
    }

    fn run_check(&self) {
        match self.stage_if_newer() {
            Ok(true) => {
                self.staged.store(true, Ordering::Release);
                let _ = self.events.send(DeviceEvent::NewFirmwareAvailable);
            }
            Ok(false) => info!("firmware {} is current", self.firmware_version),
            Err(err) => warn!("update check failed: {err:#}"),
        }
    }

    fn stage_if_newer(&self) -> anyhow::Result<bool> {
        let manifest = fetch_manifest(&self.manifest_url)?;
        if manifest.version == self.firmware_version {
            return Ok(false);
        }

        info!(
            "firmware {} available (running {}), downloading {}",
            manifest.version, self.firmware_version, manifest.url
        );
        let (bytes, digest) = download_and_stage(&manifest.url, &manifest.sha256)?;
        info!(
            "staged firmware {} ({bytes} bytes, sha256 {digest})",
            manifest.version
        );
        Ok(true)
    }
}

impl UpdateAgent for OtaAgent {
    fn check(&mut self) -> Result<bool, LinkError> {
        if self.worker.staged.load(Ordering::Acquire) {
            return Ok(true);
        }
        if self.worker.manifest_url.is_empty() {
            return Err(LinkError::failed("no update manifest configured"));
        }
        self.worker.spawn_check()?;
        Ok(false)
    }

    fn apply(&mut self) -> Result<(), LinkError> {
        if !self.worker.staged.load(Ordering::Acquire) {
            return Err(LinkError::failed("no staged firmware"));
        }
        activate_staged_slot().map_err(LinkError::failed)?;
        info!("booting staged firmware");
        schedule_restart(RESTART_DELAY).map_err(LinkError::failed)
    }
}

/// Points the bootloader at the slot `download_and_stage` wrote. Until this
/// runs, any restart boots the current firmware.
fn activate_staged_slot() -> Result<(), EspError> {
    use esp_idf_svc::sys::{esp, esp_ota_get_next_update_partition, esp_ota_set_boot_partition};

    let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
    if partition.is_null() {
        return Err(EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_NOT_FOUND as i32 }>());
    }
    esp!(unsafe { esp_ota_set_boot_partition(partition) })
}

fn http_client() -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&http_conf)?))
}

fn fetch_manifest(url: &str) -> anyhow::Result<UpdateManifest> {
    let mut client = http_client()?;
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("manifest fetch failed with HTTP {status}"));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_MANIFEST_BYTES {
            return Err(anyhow!("update manifest exceeds {MAX_MANIFEST_BYTES} bytes"));
        }
    }

    serde_json::from_slice(&body).context("invalid update manifest")
}

/// Streams an image into the inactive OTA slot and validates it. The slot is
/// not made bootable here; see [`activate_staged_slot`].
fn download_and_stage(url: &str, expected_sha256: &str) -> anyhow::Result<(u64, String)> {
    let mut client = http_client()?;
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("OTA download failed with HTTP {status}"));
    }

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write_all(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);
    }

    if total_written == 0 {
        return Err(anyhow!("OTA download body is empty"));
    }

    let digest_hex = to_hex(&hasher.finalize());
    if !digest_matches(expected_sha256, &digest_hex) {
        let _ = update.abort();
        return Err(anyhow!(
            "sha256 mismatch (expected {}, got {digest_hex})",
            expected_sha256.trim()
        ));
    }

    update
        .finish()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    drop(ota);

    Ok((total_written, digest_hex))
}

fn mark_running_slot_valid() {
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }
}

fn schedule_restart(delay: Duration) -> std::io::Result<()> {
    thread::Builder::new()
        .name("restart".into())
        .stack_size(3 * 1024)
        .spawn(move || {
            thread::sleep(delay);
            info!("restarting");
            unsafe { esp_idf_svc::sys::esp_restart() };
        })?;
    Ok(())
}

impl DeviceActions for EspActions {
    fn invoke(&mut self, action: DeviceAction) -> Result<(), LinkError> {
        match action {
            DeviceAction::Restart => {
                info!("restart command received");
                schedule_restart(RESTART_DELAY).map_err(LinkError::failed)
            }
            DeviceAction::Identify => {
                let Some(led) = self.led.clone() else {
                    return Err(LinkError::failed("status LED unavailable"));
                };
                thread::Builder::new()
                    .name("identify".into())
                    .stack_size(3 * 1024)
                    .spawn(move || blink(&led))
                    .map(|_| ())
                    .map_err(LinkError::failed)
            }
        }
    }
}

fn blink(led: &Mutex<StatusLed>) {
    let Ok(mut pin) = led.try_lock() else {
        return;
    };
    for _ in 0..IDENTIFY_BLINKS {
        let _ = pin.set_high();
        thread::sleep(IDENTIFY_BLINK);
        let _ = pin.set_low();
        thread::sleep(IDENTIFY_BLINK);
    }
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(pin)
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn spawn_key_scanner(events: Sender<DeviceEvent>) -> anyhow::Result<()> {
    let mut rows = ROW_PINS
        .iter()
        .map(|pin| -> Result<RowPin, EspError> {
            let mut row = unsafe { PinDriver::output(AnyOutputPin::new(*pin)) }?;
            row.set_high()?;
            Ok(row)
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to configure keypad rows")?;
    let cols = COL_PINS
        .iter()
        .map(|pin| -> Result<ColPin, EspError> {
            let mut col = unsafe { PinDriver::input(AnyInputPin::new(*pin)) }?;
            col.set_pull(Pull::Up)?;
            Ok(col)
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to configure keypad columns")?;

    thread::Builder::new()
        .name("keypad".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut debouncer = KeyDebouncer::new();
            loop {
                if let Some(key) = debouncer.sample(scan_matrix(&mut rows, &cols)) {
                    if events.send(DeviceEvent::KeyPressed(key)).is_err() {
                        break;
                    }
                }
                thread::sleep(KEY_SCAN_INTERVAL);
            }
        })?;
    info!("keypad matrix scanning");
    Ok(())
}

/// Drives each row low in turn and reads the pulled-up columns. Returns the
/// single key held down, or `None` for no key or several.
fn scan_matrix(rows: &mut [RowPin], cols: &[ColPin]) -> Option<char> {
    let mut found = None;
    let mut held = 0;

    for (row_index, row) in rows.iter_mut().enumerate() {
        let _ = row.set_low();
        for (col_index, col) in cols.iter().enumerate() {
            if col.is_low() {
                held += 1;
                found = key_at(row_index, col_index);
            }
        }
        let _ = row.set_high();
    }

    if held == 1 {
        found
    } else {
        None
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
