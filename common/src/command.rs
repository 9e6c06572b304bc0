use thiserror::Error;

pub const MAX_COMMAND_BYTES: usize = 32;

/// Device-specific actions reachable from the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Restart,
    Identify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReportState,
    CheckUpdate,
    Device(DeviceAction),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command payload is {0} bytes, limit is {max}", max = MAX_COMMAND_BYTES)]
    TooLong(usize),
    #[error("command payload is not UTF-8")]
    NotUtf8,
}

/// Reads a command token from a raw payload. The token is taken as-is.
pub fn parse_token(payload: &[u8]) -> Result<&str, CommandError> {
    if payload.len() > MAX_COMMAND_BYTES {
        return Err(CommandError::TooLong(payload.len()));
    }
    core::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)
}

/// Closed mapping from exact command tokens to commands.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: Vec<(&'static str, Command)>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::empty()
            .with("state", Command::ReportState)
            .with("update", Command::CheckUpdate)
            .with("restart", Command::Device(DeviceAction::Restart))
            .with("identify", Command::Device(DeviceAction::Identify))
    }
}

impl CommandTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds `token`, replacing any existing binding for it.
    pub fn with(mut self, token: &'static str, command: Command) -> Self {
        self.entries.retain(|(existing, _)| *existing != token);
        self.entries.push((token, command));
        self
    }

    pub fn lookup(&self, token: &str) -> Option<Command> {
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == token)
            .map(|(_, command)| *command)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(token, _)| *token)
    }
}
