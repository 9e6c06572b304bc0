//! Contracts for the collaborators the keypad core drives.
//!
//! Every call is expected to return promptly. Retries and timeouts belong to
//! the implementation, never to the caller.

use std::fmt;

use thiserror::Error;

use crate::command::DeviceAction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("link queue is full")]
    Busy,
    #[error("{0}")]
    Failed(String),
}

impl LinkError {
    pub fn failed(err: impl fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

pub trait ConfigStore {
    /// Returns the stored document, or `None` on first boot.
    fn load(&mut self) -> Result<Option<Vec<u8>>, LinkError>;
    fn save(&mut self, document: &[u8]) -> Result<(), LinkError>;
}

pub trait TimeSync {
    /// Starts synchronizing. Completion is reported as a time-ready event.
    fn start(&mut self) -> Result<(), LinkError>;
}

pub trait Messaging {
    /// Starts connecting. Completion is reported as a messaging-connected event.
    fn connect(&mut self) -> Result<(), LinkError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError>;
}

pub trait UpdateAgent {
    /// Looks for new firmware. Returns `true` if an image is already staged;
    /// otherwise a later firmware-available event may follow.
    fn check(&mut self) -> Result<bool, LinkError>;
    /// Hands control to the staged image. On success the device restarts.
    fn apply(&mut self) -> Result<(), LinkError>;
}

pub trait DeviceActions {
    fn invoke(&mut self, action: DeviceAction) -> Result<(), LinkError>;
}
