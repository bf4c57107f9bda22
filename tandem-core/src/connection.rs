//! Connection lifecycle: lazy connect, reset on transport errors, teardown.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tandem_lock::{LeaseSettings, Redlock};
use tandem_store::{Store, StoreConnector, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Result, TandemError};

/// Connection state of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live store connection; the next operation connects.
    Disconnected,
    /// A connect is in flight.
    Connecting,
    /// Store connection and lease primitive ready.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Receives connection lifecycle notifications.
///
/// Every method defaults to a no-op. Callbacks run inline on the task that
/// observed the event and must not block.
pub trait ConnectionListener: Send + Sync {
    /// A store connection was established.
    fn on_connected(&self) {}

    /// A transport error was observed.
    fn on_error(&self, _error: &StoreError) {}

    /// The connection was dropped after an error; the next operation reconnects.
    fn on_reconnecting(&self) {}

    /// `disconnect` completed.
    fn on_disconnected(&self) {}
}

/// Listener that ignores every event.
pub(crate) struct NoopListener;

impl ConnectionListener for NoopListener {}

/// A live connection: the shared store client and the lease primitive bound to it.
#[derive(Clone)]
pub(crate) struct Connection {
    pub store: Arc<dyn Store>,
    pub redlock: Redlock,
}

pub(crate) struct Lifecycle {
    connector: Arc<dyn StoreConnector>,
    lease: LeaseSettings,
    listener: Arc<dyn ConnectionListener>,
    state: RwLock<ConnectionState>,
    active: Mutex<Option<Connection>>,
}

impl Lifecycle {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        lease: LeaseSettings,
        listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        Self {
            connector,
            lease,
            listener,
            state: RwLock::new(ConnectionState::Disconnected),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Return the live connection, connecting first if there is none.
    ///
    /// Concurrent first callers queue on the same connect.
    pub async fn ensure(&self) -> Result<Connection> {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.as_ref() {
            return Ok(conn.clone());
        }
        // Loaded configs bypass the builders; refuse before touching the store.
        self.lease.validate()?;

        *self.state.write() = ConnectionState::Connecting;
        debug!("Connecting to store");

        match self.connector.connect().await {
            Ok(store) => {
                let conn = Connection {
                    redlock: Redlock::new(store.clone(), self.lease.clone()),
                    store,
                };
                *active = Some(conn.clone());
                *self.state.write() = ConnectionState::Connected;
                info!(backend = conn.store.backend(), "Connected to store");
                self.listener.on_connected();
                Ok(conn)
            }
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                warn!(error = %e, "Store connection failed");
                self.listener.on_error(&e);
                Err(e.into())
            }
        }
    }

    /// Inspect the outcome of an operation on `conn`; drop the connection
    /// on transport errors.
    pub async fn observe<T>(
        &self,
        conn: &Connection,
        result: std::result::Result<T, StoreError>,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(conn, e).await),
        }
    }

    /// Convert a store error from `conn`, dropping the connection first if
    /// it is a transport error.
    pub async fn fail(&self, conn: &Connection, error: StoreError) -> TandemError {
        if error.is_connection_error() {
            self.reset(conn, &error).await;
        }
        error.into()
    }

    async fn reset(&self, failed: &Connection, error: &StoreError) {
        warn!(error = %error, "Transport error, dropping store connection");
        self.listener.on_error(error);

        let previous = {
            let mut active = self.active.lock().await;
            // Another caller may already have replaced the failed connection.
            match active.as_ref() {
                Some(current) if std::ptr::addr_eq(Arc::as_ptr(&current.store), Arc::as_ptr(&failed.store)) => {
                    *self.state.write() = ConnectionState::Disconnected;
                    active.take()
                }
                _ => None,
            }
        };

        // Not quit: leases taken on it still renew and release through it.
        if previous.is_some() {
            debug!("Dropped failed store connection");
            self.listener.on_reconnecting();
        }
    }

    /// Quit the store connection. Never fails.
    pub async fn disconnect(&self) {
        let previous = self.active.lock().await.take();
        if let Some(conn) = previous
            && let Err(e) = conn.store.quit().await {
                warn!(error = %e, "Store quit failed");
            }
        *self.state.write() = ConnectionState::Disconnected;
        info!("Disconnected from store");
        self.listener.on_disconnected();
    }
}
