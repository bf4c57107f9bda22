//! Store key namespaces.
//!
//! Deployments share these prefixes; changing them breaks interoperability.

pub use tandem_lock::{LOCK_PREFIX, lock_key};

/// Namespace of key-value entries.
pub const DATA_PREFIX: &str = "data";
/// Namespace of queue topics.
pub const TOPIC_PREFIX: &str = "topic";
/// Namespace of pub/sub channels.
pub const CHANNEL_PREFIX: &str = "channel";

/// Store key of a key-value entry.
pub fn data_key(key: &str) -> String {
    format!("{}:{}", DATA_PREFIX, key)
}

/// Store key of a queue topic.
pub fn topic_key(topic: &str) -> String {
    format!("{}:{}", TOPIC_PREFIX, topic)
}

/// Store channel of a pub/sub channel.
pub fn channel_key(channel: &str) -> String {
    format!("{}:{}", CHANNEL_PREFIX, channel)
}
