//! The coordinator handle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tandem_lock::LockManager;
use tandem_store::{MemoryBackend, RedisConnector, Store, StoreConnector};
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{Connection, ConnectionListener, ConnectionState, Lifecycle, NoopListener};
use crate::pubsub::{self, ActiveSubscription};
use crate::{Result, TandemConfig};

/// Coordination handle over a shared store.
///
/// Cheap to clone; clones share the connection, the lock table and the
/// subscriptions. Every operation connects lazily on first use.
#[derive(Clone)]
pub struct Tandem {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub config: TandemConfig,
    pub lifecycle: Lifecycle,
    pub locks: LockManager,
    pub subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
}

impl Tandem {
    /// Create a coordinator talking to Redis.
    pub fn new(config: TandemConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Create a coordinator on an in-memory backend.
    pub fn memory(backend: &MemoryBackend) -> Self {
        Self::builder().memory(backend).build()
    }

    /// Create a builder.
    pub fn builder() -> TandemBuilder {
        TandemBuilder::default()
    }

    /// Get the configuration.
    pub fn config(&self) -> &TandemConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// Whether a store connection is live.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect now instead of on first use. Cheap no-op when connected.
    pub async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    /// Release held locks, close every subscription and the store
    /// connection.
    ///
    /// Always completes: teardown failures are logged and skipped.
    pub async fn disconnect(&self) {
        let released = self.inner.locks.release_all().await;
        let closed = pubsub::close_all(&self.inner.subscriptions).await;
        self.inner.lifecycle.disconnect().await;
        debug!(released = released, closed = closed, "Coordinator torn down");
    }

    pub(crate) async fn connection(&self) -> Result<Connection> {
        self.inner.lifecycle.ensure().await
    }

    /// Run one store operation on the live connection.
    pub(crate) async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Store>) -> Fut,
        Fut: Future<Output = tandem_store::Result<T>>,
    {
        let conn = self.connection().await?;
        let result = op(conn.store.clone()).await;
        self.inner.lifecycle.observe(&conn, result).await
    }
}

/// Builder for [`Tandem`].
#[derive(Default)]
pub struct TandemBuilder {
    config: Option<TandemConfig>,
    connector: Option<Arc<dyn StoreConnector>>,
    listener: Option<Arc<dyn ConnectionListener>>,
}

impl TandemBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: TandemConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom store connector instead of Redis.
    pub fn connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use an in-memory backend instead of Redis.
    pub fn memory(self, backend: &MemoryBackend) -> Self {
        self.connector(Arc::new(backend.clone()))
    }

    /// Receive connection lifecycle notifications.
    pub fn listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the coordinator. Nothing connects until first use.
    pub fn build(self) -> Tandem {
        let config = self.config.unwrap_or_default();
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(RedisConnector::new(config.store.clone())));
        let listener = self.listener.unwrap_or_else(|| Arc::new(NoopListener));

        Tandem {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(connector, config.lease.clone(), listener),
                locks: LockManager::new(),
                subscriptions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tandem_store::StoreError;

    #[derive(Default)]
    struct Recorder {
        events: SyncMutex<Vec<&'static str>>,
    }

    impl ConnectionListener for Recorder {
        fn on_connected(&self) {
            self.events.lock().push("connected");
        }

        fn on_error(&self, _error: &StoreError) {
            self.events.lock().push("error");
        }

        fn on_reconnecting(&self) {
            self.events.lock().push("reconnecting");
        }

        fn on_disconnected(&self) {
            self.events.lock().push("disconnected");
        }
    }

    #[tokio::test]
    async fn test_lazy_connect_happens_once() {
        let backend = MemoryBackend::new();
        let tandem = Tandem::memory(&backend);
        assert_eq!(tandem.state(), ConnectionState::Disconnected);
        assert_eq!(backend.connection_count(), 0);

        tandem.set("a", &1).await.unwrap();
        tandem.connect().await.unwrap();
        tandem.get::<i32>("a").await.unwrap();

        assert!(tandem.is_connected());
        assert_eq!(backend.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_connects_once() {
        let backend = MemoryBackend::new();
        let tandem = Tandem::memory(&backend);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let tandem = tandem.clone();
                tokio::spawn(async move { tandem.set(&format!("k{}", i), &i).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(backend.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_resets_and_reconnects() {
        let backend = MemoryBackend::new();
        let recorder = Arc::new(Recorder::default());
        let tandem = Tandem::builder()
            .memory(&backend)
            .listener(recorder.clone())
            .build();

        tandem.set("k", &"v").await.unwrap();
        backend.set_offline(true);

        let err = tandem.get::<String>("k").await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(tandem.state(), ConnectionState::Disconnected);

        assert!(tandem.get::<String>("k").await.is_err());
        assert_eq!(tandem.state(), ConnectionState::Disconnected);

        backend.set_offline(false);
        assert_eq!(tandem.get::<String>("k").await.unwrap(), Some("v".to_string()));
        assert!(tandem.is_connected());
        assert_eq!(backend.connection_count(), 2);

        assert_eq!(
            *recorder.events.lock(),
            vec!["connected", "error", "reconnecting", "error", "connected"]
        );
    }

    #[tokio::test]
    async fn test_disconnect_then_reuse() {
        let backend = MemoryBackend::new();
        let recorder = Arc::new(Recorder::default());
        let tandem = Tandem::builder()
            .memory(&backend)
            .listener(recorder.clone())
            .build();

        tandem.set("k", &1).await.unwrap();
        tandem.disconnect().await;
        assert_eq!(tandem.state(), ConnectionState::Disconnected);

        // Next use connects again.
        assert_eq!(tandem.get::<i32>("k").await.unwrap(), Some(1));
        assert_eq!(backend.connection_count(), 2);
        assert_eq!(
            *recorder.events.lock(),
            vec!["connected", "disconnected", "connected"]
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_completes() {
        let tandem = Tandem::memory(&MemoryBackend::new());
        tandem.disconnect().await;
        tandem.disconnect().await;
        assert_eq!(tandem.state(), ConnectionState::Disconnected);
    }
}
