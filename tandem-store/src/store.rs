//! Store client traits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::pubsub::Subscription;
use crate::Result;

/// Primitive operations of the shared backend.
///
/// Implementations are thin transports: no namespacing, no serialization.
/// Values are opaque strings. The conditional operations exist for lease
/// locks and must be atomic on the backend side.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a value. `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, overwriting any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Append to the tail of a list. Returns the new list length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;

    /// Remove and return the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// Publish a payload. Returns the number of receivers reported by the backend.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u32>;

    /// Set `key` to `value` with a time-to-live only if the key is absent
    /// (`SET key value NX PX ttl`).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the time-to-live of `key` only if it currently holds `expected`.
    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Open a dedicated connection subscribed to `channel`.
    ///
    /// Returns once the SUBSCRIBE handshake has completed, so every message
    /// published afterwards is delivered to the subscription.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Close the shared connection. Further calls fail with
    /// [`StoreError::Closed`](crate::StoreError::Closed).
    async fn quit(&self) -> Result<()>;

    /// Backend name for diagnostics.
    fn backend(&self) -> &'static str;
}

/// Opens store connections.
///
/// The coordinator holds a connector rather than a store so it can connect
/// lazily and reconnect after transport failures.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open a new shared connection.
    async fn connect(&self) -> Result<Arc<dyn Store>>;
}
