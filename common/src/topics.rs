/// Longest topic name the device will publish to, in bytes.
pub const TOPIC_MAX_LEN: usize = 64;

pub const COMMAND_TOPIC_SUFFIX: &str = "command";
pub const STATE_TOPIC_SUFFIX: &str = "state";

pub fn command_topic(device_id: &str) -> String {
    format!("{device_id}/{COMMAND_TOPIC_SUFFIX}")
}

pub fn default_state_topic(device_id: &str) -> String {
    format!("{device_id}/{STATE_TOPIC_SUFFIX}")
}
