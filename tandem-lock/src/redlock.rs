//! Lease lock primitive over a single store.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tandem_store::Store;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{LeaseSettings, LockError, LockResult};

/// A lease held on one resource key.
#[derive(Debug, Clone)]
pub struct Lease {
    resource: String,
    token: String,
    ttl: Duration,
    valid_until: Instant,
    attempts: u32,
}

impl Lease {
    /// Resource key the lease is stored under.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Random token proving ownership.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// TTL the lease was last set with.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts the acquisition took.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Instant after which the lease must be considered lost.
    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    /// Validity left, drift already deducted.
    pub fn remaining(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }

    /// Whether the lease is still valid.
    pub fn is_valid(&self) -> bool {
        self.remaining() > Duration::ZERO
    }
}

/// Drift-tolerant lease lock with bounded retry and jitter.
///
/// Each attempt writes a fresh random token with `SET NX PX`. An attempt
/// only counts if the lease is still valid after subtracting the time the
/// round trip took and the drift allowance; otherwise the write is undone
/// and the attempt retried.
#[derive(Clone)]
pub struct Redlock {
    store: Arc<dyn Store>,
    settings: LeaseSettings,
}

impl Redlock {
    /// Create a lease primitive bound to `store`.
    pub fn new(store: Arc<dyn Store>, settings: LeaseSettings) -> Self {
        Self { store, settings }
    }

    /// Get the settings.
    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    /// Acquire a lease on `resource`, retrying per the settings.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> LockResult<Lease> {
        self.settings.validate()?;
        let max_attempts = self.settings.max_attempts();

        for attempt in 1..=max_attempts {
            if let Some(lease) = self.attempt(resource, ttl, attempt).await? {
                info!(resource = %resource, attempts = attempt, "Acquired lock");
                return Ok(lease);
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }

        warn!(resource = %resource, attempts = max_attempts, "Gave up acquiring lock");
        Err(LockError::AcquireFailed {
            resource: resource.to_string(),
            attempts: max_attempts,
        })
    }

    /// Single acquisition attempt, no retry.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> LockResult<Option<Lease>> {
        self.settings.validate()?;
        self.attempt(resource, ttl, 1).await
    }

    async fn attempt(&self, resource: &str, ttl: Duration, attempt: u32) -> LockResult<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        let start = Instant::now();

        if !self.store.set_if_absent(resource, &token, ttl).await? {
            debug!(resource = %resource, attempt = attempt, "Lock already held");
            return Ok(None);
        }

        let spent = start.elapsed() + self.settings.drift(ttl);
        if spent >= ttl {
            debug!(resource = %resource, attempt = attempt, "Lease expired before it was confirmed");
            let _ = self.store.delete_if_equals(resource, &token).await;
            return Ok(None);
        }

        Ok(Some(Lease {
            resource: resource.to_string(),
            token,
            ttl,
            valid_until: start + ttl - self.settings.drift(ttl),
            attempts: attempt,
        }))
    }

    /// Reset the lease's TTL. Fails with [`LockError::NotHeld`] when the
    /// lease already expired or was taken over.
    pub async fn extend(&self, lease: &Lease, ttl: Duration) -> LockResult<Lease> {
        let start = Instant::now();
        if !self.store.extend_if_equals(&lease.resource, &lease.token, ttl).await? {
            return Err(LockError::NotHeld(lease.resource.clone()));
        }

        debug!(resource = %lease.resource, "Extended lock");
        Ok(Lease {
            ttl,
            valid_until: start + ttl.saturating_sub(self.settings.drift(ttl)),
            ..lease.clone()
        })
    }

    /// Release the lease. Fails with [`LockError::NotHeld`] when the lease
    /// already expired or was taken over.
    pub async fn release(&self, lease: &Lease) -> LockResult<()> {
        if self.store.delete_if_equals(&lease.resource, &lease.token).await? {
            debug!(resource = %lease.resource, "Released lock");
            Ok(())
        } else {
            warn!(resource = %lease.resource, "Failed to release lock (not held or expired)");
            Err(LockError::NotHeld(lease.resource.clone()))
        }
    }

    fn retry_delay(&self) -> Duration {
        let base = self.settings.retry_delay.as_millis() as i64;
        let jitter = self.settings.retry_jitter.as_millis() as i64;
        let offset = if jitter > 0 {
            rand::rng().random_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::from_millis((base + offset).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_store::MemoryBackend;

    fn redlock(backend: &MemoryBackend, settings: LeaseSettings) -> Redlock {
        Redlock::new(Arc::new(backend.store().unwrap()), settings)
    }

    fn fast() -> LeaseSettings {
        LeaseSettings::default()
            .with_retry_count(3)
            .with_retry_delay(Duration::from_millis(10))
            .with_retry_jitter(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_acquire_writes_token() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, fast());

        let lease = redlock.acquire("lock:a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(backend.raw_value("lock:a"), Some(lease.token().to_string()));
        assert_eq!(lease.attempts(), 1);
        assert!(lease.is_valid());
        assert!(lease.remaining() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_retries() {
        let backend = MemoryBackend::new();
        let holder = redlock(&backend, fast());
        let contender = redlock(&backend, fast());

        holder.acquire("lock:a", Duration::from_secs(60)).await.unwrap();
        let err = contender.acquire("lock:a", Duration::from_secs(60)).await.unwrap_err();

        assert!(matches!(err, LockError::AcquireFailed { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_once_lease_expires() {
        let backend = MemoryBackend::new();
        let holder = redlock(&backend, fast());
        let contender = redlock(&backend, fast());

        holder.acquire("lock:a", Duration::from_millis(15)).await.unwrap();
        let lease = contender.acquire("lock:a", Duration::from_secs(1)).await.unwrap();
        assert!(lease.attempts() > 1);
    }

    #[tokio::test]
    async fn test_ttl_shorter_than_drift_is_never_valid() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, fast().with_retry_count(0));

        let err = redlock.acquire("lock:a", Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, LockError::AcquireFailed { .. }));
        assert_eq!(backend.raw_value("lock:a"), None);
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected_before_writing() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, fast().with_drift_factor(-0.1));

        let err = redlock.acquire("lock:a", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidSettings(_)));
        assert!(matches!(
            redlock.try_acquire("lock:a", Duration::from_secs(1)).await,
            Err(LockError::InvalidSettings(_))
        ));
        assert_eq!(backend.raw_value("lock:a"), None);
    }

    #[tokio::test]
    async fn test_release_only_own_lease() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, fast());

        let lease = redlock.acquire("lock:a", Duration::from_secs(1)).await.unwrap();
        redlock.release(&lease).await.unwrap();
        assert!(matches!(redlock.release(&lease).await, Err(LockError::NotHeld(_))));
    }

    #[tokio::test]
    async fn test_extend_resets_ttl() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, fast());

        let lease = redlock.acquire("lock:a", Duration::from_millis(200)).await.unwrap();
        let extended = redlock.extend(&lease, Duration::from_secs(10)).await.unwrap();

        assert_eq!(extended.token(), lease.token());
        assert!(backend.ttl("lock:a").unwrap() > Duration::from_secs(9));
        assert!(extended.remaining() > Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_zero_jitter_delay_is_exact() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, fast());
        assert_eq!(redlock.retry_delay(), Duration::from_millis(10));
    }
}
