//! Per-instance lock bookkeeping on top of the lease primitive.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::redlock::{Lease, Redlock};
use crate::LockResult;

/// Namespace of lease keys in the store.
pub const LOCK_PREFIX: &str = "lock";

/// Canonical store key of the lock guarding `key`.
///
/// The only place lock keys are derived; acquire and release both go
/// through it.
pub fn lock_key(key: &str) -> String {
    format!("{}:{}", LOCK_PREFIX, key)
}

/// A held lock, as recorded by the [`LockManager`] that acquired it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// Caller-facing key.
    pub key: String,
    /// Store key of the lease (`lock:<key>`).
    pub resource: String,
    /// Ownership token stored as the lease value.
    pub token: String,
    /// Id of the owning lock manager.
    pub holder: Uuid,
    /// TTL requested at acquisition.
    pub ttl: Duration,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// Expiry of the initial lease, before any extension.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// A new lease was taken.
    Fresh(Lock),
    /// This manager already held the key; nothing was done.
    AlreadyHeld(Lock),
}

impl Acquired {
    /// The lock now held.
    pub fn lock(&self) -> &Lock {
        match self {
            Self::Fresh(lock) | Self::AlreadyHeld(lock) => lock,
        }
    }

    /// Whether this call took the lease.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

struct HeldLock {
    lock: Lock,
    lease: Arc<Mutex<Lease>>,
    redlock: Redlock,
    renewal: Option<JoinHandle<()>>,
}

impl HeldLock {
    fn is_valid(&self) -> bool {
        self.lease.lock().is_valid()
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

type Scopes = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Lock table of one coordinator instance.
///
/// Holds at most one lock per key. Cross-process exclusion comes from the
/// lease primitive alone; the table only remembers what this instance
/// holds so repeated acquisition is a no-op and release finds its token.
pub struct LockManager {
    id: Uuid,
    table: Mutex<HashMap<String, HeldLock>>,
    scopes: Scopes,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            table: Mutex::new(HashMap::new()),
            scopes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Id recorded as the holder of every lock taken here.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Acquire the lock for `key` through `redlock`.
    ///
    /// Returns immediately when this manager already holds the key. Two
    /// unserialized callers racing on the same key in one process can both
    /// reach the lease primitive; use [`LockManager::scope`] to order them.
    pub async fn acquire(&self, redlock: &Redlock, key: &str, ttl: Duration) -> LockResult<Acquired> {
        let resource = lock_key(key);

        {
            let mut table = self.table.lock();
            match table.get(&resource) {
                Some(held) if held.is_valid() => {
                    debug!(key = %key, "Lock already held by this instance");
                    return Ok(Acquired::AlreadyHeld(held.lock.clone()));
                }
                Some(_) => {
                    warn!(key = %key, "Held lease lapsed, acquiring again");
                    table.remove(&resource);
                }
                None => {}
            }
        }

        let lease = redlock.acquire(&resource, ttl).await?;
        let acquired_at = Utc::now();
        let lock = Lock {
            key: key.to_string(),
            resource: resource.clone(),
            token: lease.token().to_string(),
            holder: self.id,
            ttl,
            acquired_at,
            expires_at: chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| acquired_at.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let lease = Arc::new(Mutex::new(lease));
        let renewal = redlock
            .settings()
            .automatic_extension_threshold
            .map(|threshold| spawn_renewal(redlock.clone(), lease.clone(), ttl, threshold));

        let previous = self.table.lock().insert(
            resource,
            HeldLock {
                lock: lock.clone(),
                lease,
                redlock: redlock.clone(),
                renewal,
            },
        );
        if previous.is_some() {
            warn!(key = %key, "Concurrent acquisition replaced a lock entry");
        }

        Ok(Acquired::Fresh(lock))
    }

    /// Release the lock for `key`.
    ///
    /// No-op when the key is not held. Lease release failures (the lease
    /// may have expired already) are logged, never returned; the table
    /// entry is removed either way.
    pub async fn release(&self, key: &str) {
        let Some(held) = self.table.lock().remove(&lock_key(key)) else {
            return;
        };
        Self::release_held(held).await;
    }

    /// Release every held lock. Returns how many were held.
    pub async fn release_all(&self) -> usize {
        let held: Vec<HeldLock> = self.table.lock().drain().map(|(_, held)| held).collect();
        let count = held.len();
        for lock in held {
            Self::release_held(lock).await;
        }
        count
    }

    async fn release_held(mut held: HeldLock) {
        if let Some(renewal) = held.renewal.take() {
            renewal.abort();
        }
        let lease = held.lease.lock().clone();
        if let Err(e) = held.redlock.release(&lease).await {
            warn!(key = %held.lock.key, error = %e, "Lock release failed, lease left to expire");
        }
    }

    /// Whether this manager holds a still valid lease on `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.table
            .lock()
            .get(&lock_key(key))
            .is_some_and(HeldLock::is_valid)
    }

    /// The lock held for `key`, if its lease is still valid.
    pub fn get(&self, key: &str) -> Option<Lock> {
        self.table
            .lock()
            .get(&lock_key(key))
            .filter(|held| held.is_valid())
            .map(|held| held.lock.clone())
    }

    /// Remaining validity of the lease held for `key`, renewals included.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.table
            .lock()
            .get(&lock_key(key))
            .map(|held| held.lease.lock().remaining())
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether no lock is held.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Wait for exclusive in-process use of `key`.
    ///
    /// Orders callers of this manager only; it takes no lease.
    pub async fn scope(&self, key: &str) -> ScopeGuard {
        let resource = lock_key(key);
        let mutex = self
            .scopes
            .lock()
            .entry(resource.clone())
            .or_default()
            .clone();

        ScopeGuard {
            resource,
            scopes: self.scopes.clone(),
            _guard: mutex.lock_owned().await,
        }
    }
}

/// In-process exclusive use of a key, released on drop.
pub struct ScopeGuard {
    resource: String,
    scopes: Scopes,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut scopes = self.scopes.lock();
        // Map entry plus our guard: nobody else is waiting.
        if scopes
            .get(&self.resource)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2)
        {
            scopes.remove(&self.resource);
        }
    }
}

fn spawn_renewal(
    redlock: Redlock,
    lease: Arc<Mutex<Lease>>,
    ttl: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    // A threshold above half the TTL would renew back to back.
    let lead = threshold.min(ttl / 2);
    let backoff = (lead / 4).max(Duration::from_millis(1));

    tokio::spawn(async move {
        loop {
            let wait = lease.lock().remaining().saturating_sub(lead);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;

            let current = lease.lock().clone();
            loop {
                match redlock.extend(&current, ttl).await {
                    Ok(extended) => {
                        *lease.lock() = extended;
                        break;
                    }
                    // Transport blips are retried while the lease still stands.
                    Err(e) if e.is_connection_error() && current.is_valid() => {
                        debug!(resource = %current.resource(), error = %e, "Lock extension failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        warn!(resource = %current.resource(), error = %e, "Lock extension failed, lease will expire");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeaseSettings;
    use tandem_store::MemoryBackend;

    fn redlock(backend: &MemoryBackend, settings: LeaseSettings) -> Redlock {
        Redlock::new(Arc::new(backend.store().unwrap()), settings)
    }

    fn no_renewal() -> LeaseSettings {
        LeaseSettings::default()
            .with_retry_count(2)
            .with_retry_delay(Duration::from_millis(5))
            .with_retry_jitter(Duration::ZERO)
            .with_automatic_extension(None)
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("counter"), "lock:counter");
        assert_eq!(lock_key(""), "lock:");
    }

    #[tokio::test]
    async fn test_acquire_is_reentrant() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, no_renewal());
        let manager = LockManager::new();

        let first = manager.acquire(&redlock, "k", Duration::from_secs(1)).await.unwrap();
        let second = manager.acquire(&redlock, "k", Duration::from_secs(1)).await.unwrap();

        assert!(first.is_fresh());
        assert!(!second.is_fresh());
        assert_eq!(first.lock(), second.lock());
        assert_eq!(first.lock().resource, "lock:k");
        assert_eq!(first.lock().holder, manager.id());
        assert_eq!(manager.len(), 1);
        assert_eq!(backend.raw_value("lock:k"), Some(first.lock().token.clone()));
    }

    #[tokio::test]
    async fn test_release_unheld_is_noop() {
        let backend = MemoryBackend::new();
        let manager = LockManager::new();
        manager.release("never-locked").await;
        assert!(manager.is_empty());
        assert_eq!(backend.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_release_removes_entry_and_lease() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, no_renewal());
        let manager = LockManager::new();

        manager.acquire(&redlock, "k", Duration::from_secs(1)).await.unwrap();
        manager.release("k").await;

        assert!(!manager.is_held("k"));
        assert_eq!(backend.raw_value("lock:k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expiry_still_clears_entry() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, no_renewal());
        let manager = LockManager::new();

        manager.acquire(&redlock, "k", Duration::from_millis(50)).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        manager.release("k").await;
        assert!(!manager.is_held("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let backend = MemoryBackend::new();
        let settings = no_renewal().with_automatic_extension(Some(Duration::from_millis(500)));
        let redlock = redlock(&backend, settings);
        let manager = LockManager::new();

        manager.acquire(&redlock, "k", Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert!(backend.raw_value("lock:k").is_some());
        assert!(manager.remaining("k").unwrap() > Duration::ZERO);

        manager.release("k").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.raw_value("lock:k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_is_not_held_and_can_be_retaken() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, no_renewal());
        let manager = LockManager::new();

        manager.acquire(&redlock, "k", Duration::from_millis(50)).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(!manager.is_held("k"));
        assert_eq!(manager.get("k"), None);

        let again = manager.acquire(&redlock, "k", Duration::from_secs(1)).await.unwrap();
        assert!(again.is_fresh());
        assert_eq!(backend.raw_value("lock:k"), Some(again.lock().token.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_survives_transport_blip() {
        let backend = MemoryBackend::new();
        let settings = no_renewal().with_automatic_extension(Some(Duration::from_millis(500)));
        let redlock = redlock(&backend, settings);
        let manager = LockManager::new();

        let acquired = manager.acquire(&redlock, "k", Duration::from_millis(400)).await.unwrap();

        // Offline across the first renewal.
        backend.set_offline(true);
        tokio::time::sleep(Duration::from_millis(250)).await;
        backend.set_offline(false);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(manager.is_held("k"));
        assert_eq!(backend.raw_value("lock:k"), Some(acquired.lock().token.clone()));

        manager.release("k").await;
        assert_eq!(backend.raw_value("lock:k"), None);
    }

    #[tokio::test]
    async fn test_release_all() {
        let backend = MemoryBackend::new();
        let redlock = redlock(&backend, no_renewal());
        let manager = LockManager::new();

        manager.acquire(&redlock, "a", Duration::from_secs(1)).await.unwrap();
        manager.acquire(&redlock, "b", Duration::from_secs(1)).await.unwrap();

        assert_eq!(manager.release_all().await, 2);
        assert!(manager.is_empty());
        assert_eq!(backend.raw_value("lock:a"), None);
        assert_eq!(backend.raw_value("lock:b"), None);
    }

    #[tokio::test]
    async fn test_scope_serializes_and_cleans_up() {
        let manager = Arc::new(LockManager::new());
        let guard = manager.scope("k").await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _guard = manager.scope("k").await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(manager.scopes.lock().is_empty());
    }
}
