//! Locking and the read-modify-write helper.

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tandem_lock::{Acquired, Lock, LockError, ScopeGuard};
use tracing::{debug, warn};

use crate::error::BoxError;
use crate::{Result, Tandem, TandemError};

impl Tandem {
    /// Acquire the lock for `key` with the configured default TTL.
    pub async fn lock(&self, key: &str) -> Result<Lock> {
        self.lock_with_ttl(key, self.inner.config.lock_ttl).await
    }

    /// Acquire the lock for `key`.
    ///
    /// Returns at once if this instance already holds it. Otherwise waits
    /// for the lease, retrying per the lease settings, and fails with
    /// [`TandemError::LockAcquisition`] once retries run out.
    pub async fn lock_with_ttl(&self, key: &str, ttl: Duration) -> Result<Lock> {
        let acquired = self.acquire(key, ttl).await?;
        Ok(acquired.lock().clone())
    }

    /// Release the lock for `key`.
    ///
    /// No-op when this instance does not hold it. Never fails: a lease that
    /// expired or cannot be reached is logged and forgotten.
    pub async fn release(&self, key: &str) {
        self.inner.locks.release(key).await;
    }

    /// Whether this instance holds the lock for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner.locks.is_held(key)
    }

    /// The lock this instance holds for `key`, if any.
    pub fn held_lock(&self, key: &str) -> Option<Lock> {
        self.inner.locks.get(key)
    }

    /// Atomically transform the value under `key`, with the default TTL.
    ///
    /// See [`Tandem::with_lock_ttl`].
    pub async fn with_lock<T, F, Fut, E>(&self, key: &str, transform: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(Option<T>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        self.with_lock_ttl(key, self.inner.config.lock_ttl, transform)
            .await
    }

    /// Atomically transform the value under `key`.
    ///
    /// Takes the lock, reads the current value, applies `transform`, stores
    /// its result and releases the lock. The lock is released on every exit
    /// path: errors, a panicking transform (the panic resumes afterwards),
    /// and dropping the returned future.
    ///
    /// A failed transform yields [`TandemError::Transform`] and leaves the
    /// stored value untouched. Callers of this instance working on the same
    /// key run one at a time. If the lock was already held through
    /// [`Tandem::lock`], it is reused and stays held.
    pub async fn with_lock_ttl<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        transform: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(Option<T>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        let scope = self.inner.locks.scope(key).await;
        let acquired = self.acquire(key, ttl).await?;
        let guard = ReleaseGuard::new(self, key, scope, acquired.is_fresh());

        let outcome = AssertUnwindSafe(self.read_modify_write(key, transform))
            .catch_unwind()
            .await;

        guard.release().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn read_modify_write<T, F, Fut, E>(&self, key: &str, transform: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(Option<T>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        let current = self.get::<T>(key).await?;

        let next = match transform(current).await {
            Ok(next) => next,
            Err(e) => {
                let source = e.into();
                warn!(key = %key, error = %source, "Transform failed, nothing persisted");
                return Err(TandemError::Transform {
                    key: key.to_string(),
                    source,
                });
            }
        };

        self.set(key, &next).await?;
        Ok(next)
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Acquired> {
        let conn = self.connection().await?;
        match self.inner.locks.acquire(&conn.redlock, key, ttl).await {
            Ok(acquired) => Ok(acquired),
            Err(LockError::Store(e)) => Err(self.inner.lifecycle.fail(&conn, e).await),
            Err(e) => Err(e.into()),
        }
    }
}

/// Releases a `with_lock` lock and its in-process scope.
///
/// Dropped without [`ReleaseGuard::release`] (the caller's future was
/// cancelled), it finishes the release on a spawned task.
struct ReleaseGuard {
    tandem: Tandem,
    key: String,
    scope: Option<ScopeGuard>,
    owned: bool,
}

impl ReleaseGuard {
    fn new(tandem: &Tandem, key: &str, scope: ScopeGuard, owned: bool) -> Self {
        Self {
            tandem: tandem.clone(),
            key: key.to_string(),
            scope: Some(scope),
            owned,
        }
    }

    async fn release(mut self) {
        if self.owned {
            self.tandem.release(&self.key).await;
            self.owned = false;
        }
        self.scope.take();
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        let tandem = self.tandem.clone();
        let key = std::mem::take(&mut self.key);
        let scope = self.scope.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "Releasing lock of a cancelled with_lock");
                handle.spawn(async move {
                    tandem.release(&key).await;
                    drop(scope);
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release lock on, lease left to expire"),
        }
    }
}
