//! # Tandem Core
//!
//! Coordination for several processes sharing one Redis: namespaced
//! state, lease locks with an atomic read-modify-write helper, FIFO work
//! queues and topic pub/sub, all behind one cloneable [`Tandem`] handle.
//!
//! Every deployment pointed at the same store sees the same keys:
//!
//! | Concern | Store key |
//! |---------|-----------|
//! | State | `data:<key>` |
//! | Locks | `lock:<key>` |
//! | Queues | `topic:<topic>` |
//! | Channels | `channel:<channel>` |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tandem_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tandem = Tandem::new(TandemConfig::from_env().build());
//!
//!     tandem.set("visits", &0u64).await?;
//!     let visits = tandem
//!         .with_lock("visits", |v: Option<u64>| async move {
//!             Ok::<_, std::convert::Infallible>(v.unwrap_or(0) + 1)
//!         })
//!         .await?;
//!
//!     tandem.push("emails", &serde_json::json!({ "to": "ops@example.com" })).await?;
//!     tandem
//!         .subscribe("deploys", |version: String, _channel| async move {
//!             println!("deployed {}", version);
//!         })
//!         .await?;
//!
//!     tandem.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Connection lifecycle
//!
//! Nothing connects until the first operation. A transport error drops
//! the connection and the next operation reconnects; register a
//! [`ConnectionListener`] to observe the transitions.

mod config;
mod connection;
mod error;
pub mod keys;
mod kv;
mod lock;
mod pubsub;
mod queue;
mod tandem;

pub use config::{TandemConfig, TandemConfigBuilder};
pub use connection::{ConnectionListener, ConnectionState};
pub use error::{BoxError, Result, TandemError};
pub use pubsub::{ChannelStream, Delivery};
pub use tandem::{Tandem, TandemBuilder};

pub use tandem_lock::{LeaseSettings, Lock};
pub use tandem_store::{MemoryBackend, Store, StoreConfig, StoreConnector, StoreError};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{TandemConfig, TandemConfigBuilder};
    pub use crate::connection::{ConnectionListener, ConnectionState};
    pub use crate::error::{Result, TandemError};
    pub use crate::pubsub::{ChannelStream, Delivery};
    pub use crate::tandem::{Tandem, TandemBuilder};
    pub use tandem_lock::{LeaseSettings, Lock};
    pub use tandem_store::{MemoryBackend, StoreConfig};
}
