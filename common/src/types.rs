use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keys of the 4x4 matrix, row by row.
pub const KEYPAD_LAYOUT: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

pub fn is_keypad_key(key: char) -> bool {
    KEYPAD_LAYOUT.iter().flatten().any(|k| *k == key)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadinessState {
    #[serde(rename = "networkUp")]
    pub network_up: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "messagingConnected")]
    pub messaging_connected: bool,
    #[serde(rename = "updatePending")]
    pub update_pending: bool,
}

impl ReadinessState {
    /// Drops every flag tied to the network session. A pending update survives.
    pub fn connectivity_lost(&mut self) {
        self.network_up = false;
        self.time_synced = false;
        self.messaging_connected = false;
    }
}

const OBJECT_SLOT_BYTES: usize = 48;
const STRING_OVERHEAD_BYTES: usize = 70;

const fn object_size(fields: usize) -> usize {
    fields * OBJECT_SLOT_BYTES
}

/// Upper bound on an encoded [`StateMessage`]: three top-level fields, five
/// status fields and a margin for string escaping.
pub const STATE_MESSAGE_CAPACITY: usize =
    object_size(3) + object_size(5) + STRING_OVERHEAD_BYTES;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("state message serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state message is {len} bytes, capacity is {capacity}")]
    TooLarge { len: usize, capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceStatus {
    pub firmware: String,
    pub uptime_s: u64,
    pub time_synced: bool,
    pub update_pending: bool,
    pub last_key: Option<char>,
}

/// Payload published on the state topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateMessage {
    pub id: String,
    pub name: String,
    pub status: DeviceStatus,
}

impl StateMessage {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let body = serde_json::to_vec(self)?;
        if body.len() > STATE_MESSAGE_CAPACITY {
            return Err(EncodeError::TooLarge {
                len: body.len(),
                capacity: STATE_MESSAGE_CAPACITY,
            });
        }
        Ok(body)
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use super::*;
    use crate::config::{DEVICE_ID_MAX_LEN, DEVICE_NAME_MAX_LEN};

    fn sample() -> StateMessage {
        StateMessage {
            id: "hall".to_string(),
            name: "Hall keypad".to_string(),
            status: DeviceStatus {
                firmware: "0.1.0".to_string(),
                uptime_s: 3_600,
                time_synced: true,
                update_pending: false,
                last_key: Some('#'),
            },
        }
    }

    #[test]
    fn encoded_message_matches_fixed_schema() {
        let message = sample();
        let body = message.encode().unwrap();

        let value: Value = serde_json::from_slice(&body).unwrap();
        let mut top: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        top.sort();
        assert_eq!(top, vec!["id", "name", "status"]);
        let mut status: Vec<_> = value["status"].as_object().unwrap().keys().cloned().collect();
        status.sort();
        assert_eq!(
            status,
            vec!["firmware", "last_key", "time_synced", "update_pending", "uptime_s"]
        );

        assert_eq!(StateMessage::decode(&body).unwrap(), message);
    }

    #[test]
    fn decode_rejects_extra_keys() {
        let body = br#"{"id":"a","name":"b","extra":1,"status":{"firmware":"1","uptime_s":0,"time_synced":false,"update_pending":false,"last_key":null}}"#;
        assert!(StateMessage::decode(body).is_err());
    }

    #[test]
    fn worst_case_identity_fits_capacity() {
        let mut message = sample();
        message.id = "i".repeat(DEVICE_ID_MAX_LEN);
        message.name = "\u{1}".repeat(DEVICE_NAME_MAX_LEN);
        message.status.uptime_s = u64::MAX;
        assert!(message.encode().unwrap().len() <= STATE_MESSAGE_CAPACITY);
    }

    #[test]
    fn oversized_message_is_an_encode_error() {
        let mut message = sample();
        message.name = "x".repeat(STATE_MESSAGE_CAPACITY);
        assert!(matches!(
            message.encode(),
            Err(EncodeError::TooLarge { capacity, .. }) if capacity == STATE_MESSAGE_CAPACITY
        ));
    }

    #[test]
    fn connectivity_loss_keeps_pending_update() {
        let mut readiness = ReadinessState {
            network_up: true,
            time_synced: true,
            messaging_connected: true,
            update_pending: true,
        };
        readiness.connectivity_lost();
        assert_eq!(
            readiness,
            ReadinessState {
                update_pending: true,
                ..ReadinessState::default()
            }
        );
    }

    #[test]
    fn layout_covers_sixteen_distinct_keys() {
        let keys: std::collections::BTreeSet<_> = KEYPAD_LAYOUT.iter().flatten().collect();
        assert_eq!(keys.len(), 16);
        assert!(is_keypad_key('*'));
        assert!(!is_keypad_key('E'));
    }
}
