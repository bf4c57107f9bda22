//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_lock::LeaseSettings;
use tandem_store::{StoreConfig, duration_ms};

use crate::{Result, TandemError};

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TandemConfig {
    /// Store connection settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Lease lock tuning.
    #[serde(default)]
    pub lease: LeaseSettings,

    /// TTL used by `lock` and `with_lock` when none is given.
    #[serde(with = "duration_ms", default = "default_lock_ttl")]
    pub lock_ttl: Duration,
}

fn default_lock_ttl() -> Duration {
    Duration::from_millis(250)
}

impl Default for TandemConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lease: LeaseSettings::default(),
            lock_ttl: default_lock_ttl(),
        }
    }
}

impl TandemConfig {
    /// Create a configuration for the given Redis URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            store: StoreConfig::new(url),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> TandemConfigBuilder {
        TandemConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Store settings come from the `REDIS_*` variables; `TANDEM_LOCK_TTL_MS`
    /// and `TANDEM_LOCK_RETRY_COUNT` tune locking.
    pub fn from_env() -> TandemConfigBuilder {
        let mut builder = TandemConfigBuilder::new().store(StoreConfig::from_env().build());

        if let Ok(ttl) = std::env::var("TANDEM_LOCK_TTL_MS")
            && let Ok(millis) = ttl.parse() {
                builder = builder.lock_ttl(Duration::from_millis(millis));
            }

        if let Ok(count) = std::env::var("TANDEM_LOCK_RETRY_COUNT")
            && let Ok(count) = count.parse() {
                builder = builder.retry_count(count);
            }

        builder
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.store.connection_url()?;
        self.lease.validate()?;
        if self.lock_ttl.is_zero() {
            return Err(TandemError::Config("lock TTL must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for coordinator configuration.
#[derive(Default)]
pub struct TandemConfigBuilder {
    config: TandemConfig,
}

impl TandemConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: TandemConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.store.url = url.into();
        self
    }

    /// Replace the store settings.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Replace the lease settings.
    pub fn lease(mut self, lease: LeaseSettings) -> Self {
        self.config.lease = lease;
        self
    }

    /// Set the default lock TTL.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.lock_ttl = ttl;
        self
    }

    /// Set the lease retry count.
    pub fn retry_count(mut self, count: u32) -> Self {
        self.config.lease.retry_count = count;
        self
    }

    /// Set the lease retry delay.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.lease.retry_delay = delay;
        self
    }

    /// Set the lease retry jitter.
    pub fn retry_jitter(mut self, jitter: Duration) -> Self {
        self.config.lease.retry_jitter = jitter;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TandemConfig {
        self.config
    }
}
