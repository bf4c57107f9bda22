//! Lease locks for Tandem
//!
//! This crate provides the lease lock primitive and the per-instance lock
//! bookkeeping built on it.
//!
//! ## Features
//!
//! - **Lease Locks** - `SET NX PX` leases with random ownership tokens
//! - **Drift Tolerance** - leases are only trusted for `ttl - drift - round trip`
//! - **Retry with Jitter** - bounded attempts, fixed delay, random jitter
//! - **Automatic Extension** - held leases are renewed before they lapse
//! - **Lock Table** - explicit per-instance record of held locks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tandem_lock::*;
//! use tandem_store::{RedisStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RedisStore::connect(StoreConfig::default()).await?);
//!     let redlock = Redlock::new(store, LeaseSettings::default());
//!     let locks = LockManager::new();
//!
//!     locks.acquire(&redlock, "invoices", Duration::from_millis(250)).await?;
//!     // Critical section
//!     locks.release("invoices").await;
//!
//!     Ok(())
//! }
//! ```

mod error;
pub mod manager;
pub mod redlock;
mod settings;

pub use error::{LockError, LockResult};
pub use manager::{Acquired, LOCK_PREFIX, Lock, LockManager, ScopeGuard, lock_key};
pub use redlock::{Lease, Redlock};
pub use settings::LeaseSettings;
