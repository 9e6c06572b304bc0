pub mod command;
pub mod config;
pub mod keypad;
pub mod links;
pub mod matrix;
pub mod topics;
pub mod types;

pub use command::{Command, CommandTable, DeviceAction, MAX_COMMAND_BYTES};
pub use config::{BaseConfig, DeviceConfig, DeviceIdentity, NetworkConfig, StateTopic};
pub use keypad::{DeviceEvent, Keypad, Services};
pub use links::{ConfigStore, DeviceActions, LinkError, Messaging, TimeSync, UpdateAgent};
pub use matrix::{key_at, KeyDebouncer, MATRIX_COLS, MATRIX_ROWS};
pub use topics::*;
pub use types::{ReadinessState, StateMessage, KEYPAD_LAYOUT, STATE_MESSAGE_CAPACITY};
