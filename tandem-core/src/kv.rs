//! Namespaced key-value access.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::keys::data_key;
use crate::{Result, Tandem};

impl Tandem {
    /// Get the value stored under `key`.
    ///
    /// Returns `None` when the key is absent or holds the empty tombstone
    /// written by [`Tandem::remove`].
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let data_key = data_key(key);
        let raw = self.call(|store| async move { store.get(&data_key).await }).await?;

        match raw {
            Some(payload) if !payload.is_empty() => Ok(Some(serde_json::from_str(&payload)?)),
            _ => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing whatever was there.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let data_key = data_key(key);
        trace!(key = %key, bytes = payload.len(), "Storing value");
        self.call(|store| async move { store.set(&data_key, &payload).await })
            .await
    }

    /// Whether `key` holds a non-empty value.
    pub async fn has(&self, key: &str) -> Result<bool> {
        let data_key = data_key(key);
        let raw = self.call(|store| async move { store.get(&data_key).await }).await?;
        Ok(raw.is_some_and(|payload| !payload.is_empty()))
    }

    /// Clear `key`.
    ///
    /// Writes an empty-string tombstone rather than deleting the key, so
    /// deployments reading the raw store see the same layout. Afterwards
    /// [`Tandem::has`] is false and [`Tandem::get`] is `None`.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let data_key = data_key(key);
        self.call(|store| async move { store.set(&data_key, "").await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tandem_store::MemoryBackend;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
        score: Option<f64>,
    }

    #[tokio::test]
    async fn test_struct_round_trip() {
        let tandem = Tandem::memory(&MemoryBackend::new());
        let profile = Profile {
            name: "ada".to_string(),
            tags: vec!["admin".to_string()],
            score: Some(9.5),
        };

        tandem.set("profile", &profile).await.unwrap();
        assert_eq!(tandem.get::<Profile>("profile").await.unwrap(), Some(profile));
    }

    #[tokio::test]
    async fn test_values_are_namespaced_json() {
        let backend = MemoryBackend::new();
        let tandem = Tandem::memory(&backend);

        tandem.set("config", &json!({"retries": 3})).await.unwrap();
        assert_eq!(backend.raw_value("data:config"), Some(r#"{"retries":3}"#.to_string()));
        assert_eq!(backend.raw_value("config"), None);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let tandem = Tandem::memory(&MemoryBackend::new());
        assert_eq!(tandem.get::<i32>("nope").await.unwrap(), None);
        assert!(!tandem.has("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstone() {
        let backend = MemoryBackend::new();
        let tandem = Tandem::memory(&backend);

        tandem.set("k", &"v").await.unwrap();
        assert!(tandem.has("k").await.unwrap());

        tandem.remove("k").await.unwrap();
        assert!(!tandem.has("k").await.unwrap());
        assert_eq!(tandem.get::<String>("k").await.unwrap(), None);
        assert_eq!(backend.raw_value("data:k"), Some(String::new()));
    }

    #[tokio::test]
    async fn test_set_overwrites_without_merge() {
        let tandem = Tandem::memory(&MemoryBackend::new());
        tandem.set("k", &json!({"a": 1})).await.unwrap();
        tandem.set("k", &json!({"b": 2})).await.unwrap();
        assert_eq!(
            tandem.get::<serde_json::Value>("k").await.unwrap(),
            Some(json!({"b": 2}))
        );
    }

    #[tokio::test]
    async fn test_null_is_a_value() {
        let tandem = Tandem::memory(&MemoryBackend::new());
        tandem.set("k", &serde_json::Value::Null).await.unwrap();
        assert!(tandem.has("k").await.unwrap());
        assert_eq!(
            tandem.get::<serde_json::Value>("k").await.unwrap(),
            Some(serde_json::Value::Null)
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_serialization_error() {
        let backend = MemoryBackend::new();
        let tandem = Tandem::memory(&backend);
        tandem.set("k", &"text").await.unwrap();

        let err = tandem.get::<u64>("k").await.unwrap_err();
        assert!(matches!(err, crate::TandemError::Serialization(_)));
    }
}
