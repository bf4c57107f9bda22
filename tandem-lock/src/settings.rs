//! Lease settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_store::duration_ms;

use crate::{LockError, LockResult};

/// Tuning of the lease primitive.
///
/// The defaults favour patience: 40 retries 200 ms apart (plus up to
/// 200 ms of jitter either way) keep a caller waiting roughly eight
/// seconds before giving up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// Expected clock drift, as a fraction of the TTL.
    #[serde(default = "default_drift_factor")]
    pub drift_factor: f64,

    /// Retries after the first attempt.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base delay between attempts.
    #[serde(with = "duration_ms", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Maximum random deviation from `retry_delay`, in both directions.
    #[serde(with = "duration_ms", default = "default_retry_jitter")]
    pub retry_jitter: Duration,

    /// Renew a held lease once its remaining validity falls below this.
    /// `None` disables automatic extension.
    #[serde(with = "option_duration_ms", default = "default_extension_threshold")]
    pub automatic_extension_threshold: Option<Duration>,
}

fn default_drift_factor() -> f64 {
    0.01
}

fn default_retry_count() -> u32 {
    40
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(200)
}

fn default_extension_threshold() -> Option<Duration> {
    Some(Duration::from_millis(500))
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            drift_factor: default_drift_factor(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
            retry_jitter: default_retry_jitter(),
            automatic_extension_threshold: default_extension_threshold(),
        }
    }
}

impl LeaseSettings {
    /// Set the drift factor.
    pub fn with_drift_factor(mut self, factor: f64) -> Self {
        self.drift_factor = factor;
        self
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the retry jitter.
    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Set or disable the automatic extension threshold.
    pub fn with_automatic_extension(mut self, threshold: Option<Duration>) -> Self {
        self.automatic_extension_threshold = threshold;
        self
    }

    /// Total attempts made by one acquisition.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Drift allowance for a lease of `ttl`: `ttl * drift_factor + 2ms`.
    ///
    /// A factor that [`LeaseSettings::validate`] rejects counts as zero.
    pub fn drift(&self, ttl: Duration) -> Duration {
        let scaled = Duration::try_from_secs_f64(ttl.as_secs_f64() * self.drift_factor)
            .unwrap_or(Duration::ZERO);
        scaled + Duration::from_millis(2)
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> LockResult<()> {
        if !(0.0..1.0).contains(&self.drift_factor) {
            return Err(LockError::InvalidSettings(format!(
                "drift factor must be in [0, 1), got {}",
                self.drift_factor
            )));
        }
        Ok(())
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
