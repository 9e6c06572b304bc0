use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    links::ConfigStore,
    topics::{command_topic, default_state_topic, TOPIC_MAX_LEN},
};

pub const DEFAULT_DEVICE_ID: &str = "keypad";
pub const DEVICE_ID_MAX_LEN: usize = 32;
pub const DEVICE_NAME_MAX_LEN: usize = 32;
pub const STATE_TOPIC_KEY: &str = "state_topic";

const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name is empty")]
    Empty,
    #[error("topic name is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("topic name contains reserved character {0:?}")]
    Reserved(char),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("config document must be a JSON object")]
    NotAnObject,
}

/// Topic name that is guaranteed non-empty, at most [`TOPIC_MAX_LEN`] bytes and
/// free of MQTT wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StateTopic(String);

impl StateTopic {
    pub fn new(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TopicError::Empty);
        }
        if name.len() > TOPIC_MAX_LEN {
            return Err(TopicError::TooLong {
                len: name.len(),
                max: TOPIC_MAX_LEN,
            });
        }
        if let Some(reserved) = name.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
            return Err(TopicError::Reserved(reserved));
        }
        Ok(Self(name))
    }

    /// Default state topic for a device, `<device-id>/state`.
    pub fn derived(device_id: &str) -> Self {
        Self::new(default_state_topic(device_id))
            .unwrap_or_else(|_| Self(default_state_topic(DEFAULT_DEVICE_ID)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StateTopic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for StateTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            id: DEFAULT_DEVICE_ID.to_string(),
            name: "Keypad".to_string(),
        }
    }
}

impl DeviceIdentity {
    pub fn sanitize(&mut self) {
        if !is_valid_device_id(&self.id) {
            warn!(
                "device id {:?} is not usable in topics; falling back to `{DEFAULT_DEVICE_ID}`",
                self.id
            );
            self.id = DEFAULT_DEVICE_ID.to_string();
        }
        if self.name.trim().is_empty() || self.name.len() > DEVICE_NAME_MAX_LEN {
            self.name = self.id.clone();
        }
    }
}

fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= DEVICE_ID_MAX_LEN
        && !id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '+' | '#' | '\0'))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Location of the firmware manifest polled by the update agent. Empty
    /// disables network update checks.
    pub manifest_url: String,
}

/// Settings owned by the config store. The core never writes these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub device: DeviceIdentity,
    pub network: NetworkConfig,
    pub timezone: String,
    pub update: UpdateConfig,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            device: DeviceIdentity::default(),
            network: NetworkConfig::default(),
            timezone: "America/New_York".to_string(),
            update: UpdateConfig::default(),
        }
    }
}

impl BaseConfig {
    pub fn sanitize(&mut self) {
        self.device.sanitize();
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = DEFAULT_MQTT_PORT;
        }
    }

    /// Whether moving from `self` to `next` needs a reboot to take effect.
    pub fn restart_required(&self, next: &BaseConfig) -> bool {
        self.network != next.network || self.device.id != next.device.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    state_topic: StateTopic,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::from_base(BaseConfig::default())
    }
}

impl DeviceConfig {
    pub fn from_base(mut base: BaseConfig) -> Self {
        base.sanitize();
        let state_topic = StateTopic::derived(&base.device.id);
        Self { base, state_topic }
    }

    /// Boot-time load through the config store. Missing or unreadable storage
    /// yields defaults.
    pub fn load_from(store: &mut dyn ConfigStore) -> Self {
        match store.load() {
            Ok(Some(document)) => Self::load(&document),
            Ok(None) => {
                info!("no stored config; starting with defaults");
                Self::default()
            }
            Err(err) => {
                warn!("config store unavailable ({err}); starting with defaults");
                Self::default()
            }
        }
    }

    /// Builds the config from a stored document. Never fails: unreadable base
    /// settings fall back to defaults and the state topic goes through
    /// [`DeviceConfig::parse_config`].
    pub fn load(document: &[u8]) -> Self {
        let base = serde_json::from_slice::<BaseConfig>(document).unwrap_or_else(|err| {
            warn!("stored base config unreadable ({err}); using defaults");
            BaseConfig::default()
        });

        let mut config = Self::from_base(base);
        if !config.parse_config(document) {
            warn!("stored config document rejected; state topic left at default");
        }
        config
    }

    /// Extracts the core-owned fields from `document`.
    ///
    /// Returns `false` only if the document cannot be read as a JSON object.
    /// Missing or invalid values are replaced with defaults and still count as
    /// success. Nothing is persisted here.
    pub fn parse_config(&mut self, document: &[u8]) -> bool {
        match self.apply_document(document) {
            Ok(()) => true,
            Err(err) => {
                warn!("config document rejected: {err}");
                false
            }
        }
    }

    fn apply_document(&mut self, document: &[u8]) -> Result<(), ConfigError> {
        let value: Value = serde_json::from_slice(document)?;
        let object = value.as_object().ok_or(ConfigError::NotAnObject)?;

        self.state_topic = match object.get(STATE_TOPIC_KEY) {
            None | Some(Value::Null) => {
                debug!("no state topic configured; using default");
                StateTopic::derived(&self.base.device.id)
            }
            Some(Value::String(name)) => StateTopic::new(name.as_str()).unwrap_or_else(|err| {
                warn!("configured state topic rejected ({err}); using default");
                StateTopic::derived(&self.base.device.id)
            }),
            Some(other) => {
                warn!("state topic must be a string, got `{other}`; using default");
                StateTopic::derived(&self.base.device.id)
            }
        };
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.base.device.id
    }

    pub fn state_topic(&self) -> &StateTopic {
        &self.state_topic
    }

    pub fn command_topic(&self) -> String {
        command_topic(&self.base.device.id)
    }

    pub fn to_document(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Overlays a partial document on this config's stored form. Objects merge
    /// key by key; any other value replaces what it lands on.
    pub fn merge_document(&self, patch: &[u8]) -> Result<Vec<u8>, ConfigError> {
        let patch: Value = serde_json::from_slice(patch)?;
        if !patch.is_object() {
            return Err(ConfigError::NotAnObject);
        }

        let mut merged = serde_json::to_value(self)?;
        if let Some(current) = merged.as_object_mut() {
            // A derived topic keeps following the device id.
            if self.state_topic == StateTopic::derived(self.device_id()) {
                current.remove(STATE_TOPIC_KEY);
            }
        }
        merge_value(&mut merged, patch);

        Ok(serde_json::to_vec(&merged)?)
    }
}

fn merge_value(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
