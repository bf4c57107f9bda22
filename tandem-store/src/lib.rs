//! # Tandem Store
//!
//! Store client for Tandem: the thin transport every coordination
//! primitive is built on.
//!
//! ## Features
//!
//! - **Redis backend**: one multiplexed connection for commands, one
//!   dedicated connection per subscription
//! - **In-memory backend**: a shared in-process server for tests and
//!   single-process deployments
//! - **Lease support**: atomic set-if-absent, compare-and-delete and
//!   compare-and-extend
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tandem_store::{RedisStore, Store, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::builder()
//!         .url("redis://localhost:6379")
//!         .build();
//!
//!     let store = RedisStore::connect(config).await?;
//!     store.set("greeting", "hello").await?;
//!
//!     let mut sub = store.subscribe("events").await?;
//!     store.publish("events", "ping").await?;
//!     let message = sub.recv().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## In-memory backend
//!
//! ```
//! use tandem_store::{MemoryBackend, Store};
//!
//! # tokio_test_block_on(async {
//! let backend = MemoryBackend::new();
//! let store = backend.store().unwrap();
//! store.rpush("jobs", "a").await.unwrap();
//! assert_eq!(store.lpop("jobs").await.unwrap(), Some("a".to_string()));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

mod config;
mod error;
mod memory;
mod pubsub;
mod redis_store;
mod store;

pub use config::{StoreConfig, StoreConfigBuilder, duration_ms};
pub use error::{Result, StoreError};
pub use memory::{MemoryBackend, MemoryStore};
pub use pubsub::{Message, Subscription, SubscriptionHandle};
pub use redis_store::{RedisConnector, RedisStore};
pub use store::{Store, StoreConnector};

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{StoreConfig, StoreConfigBuilder};
    pub use crate::error::{Result, StoreError};
    pub use crate::memory::{MemoryBackend, MemoryStore};
    pub use crate::pubsub::{Message, Subscription, SubscriptionHandle};
    pub use crate::redis_store::{RedisConnector, RedisStore};
    pub use crate::store::{Store, StoreConnector};
}
