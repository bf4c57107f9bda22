//! FIFO work queues.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::keys::topic_key;
use crate::{Result, Tandem};

impl Tandem {
    /// Append `data` to the tail of `topic`.
    pub async fn push<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> Result<()> {
        let payload = serde_json::to_string(data)?;
        let key = topic_key(topic);
        let len = self
            .call(|store| async move { store.rpush(&key, &payload).await })
            .await?;
        trace!(topic = %topic, len = len, "Pushed item");
        Ok(())
    }

    /// Remove and return the head of `topic`, or `None` when it is empty.
    ///
    /// Each item goes to exactly one popper across all instances.
    pub async fn pop<T: DeserializeOwned>(&self, topic: &str) -> Result<Option<T>> {
        let key = topic_key(topic);
        let raw = self
            .call(|store| async move { store.lpop(&key).await })
            .await?;

        match raw {
            Some(payload) if !payload.is_empty() => Ok(Some(serde_json::from_str(&payload)?)),
            _ => Ok(None),
        }
    }
}
