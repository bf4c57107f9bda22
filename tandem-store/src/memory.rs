//! In-memory store backend.
//!
//! Uses DashMap for thread-safe concurrent access. A [`MemoryBackend`] plays
//! the role of the shared server: every [`MemoryStore`] connected to the
//! same backend sees the same keys, lists, and channels, so several
//! coordinators in one process behave like several processes sharing Redis.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::pubsub::{Message, Subscription};
use crate::store::{Store, StoreConnector};
use crate::{Result, StoreError};

const CHANNEL_CAPACITY: usize = 1024;

/// Stored string value.
#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct MemoryState {
    values: DashMap<String, Slot>,
    lists: DashMap<String, VecDeque<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
    connections: AtomicU64,
}

/// Shared in-memory server.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
    subscription_buffer: Option<usize>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        debug!("Creating new in-memory store backend");
        Self::default()
    }

    /// Set the per-subscription message buffer (defaults to 100).
    pub fn with_subscription_buffer(mut self, capacity: usize) -> Self {
        self.subscription_buffer = Some(capacity.max(1));
        self
    }

    /// Open a store handle on this backend.
    pub fn store(&self) -> Result<MemoryStore> {
        if self.state.offline.load(Ordering::Acquire) {
            return Err(StoreError::Connection("memory backend is offline".to_string()));
        }
        self.state.connections.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryStore {
            backend: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Simulate the server going away (`true`) or coming back (`false`).
    ///
    /// While offline, connecting and every command on existing handles fail
    /// with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::Release);
    }

    /// Number of connections opened so far, subscriber connections included.
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Raw value of a key, bypassing expiry bookkeeping.
    pub fn raw_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.state
            .values
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value.clone())
    }

    /// Remaining time-to-live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .values
            .get(key)
            .and_then(|slot| slot.expires_at)
            .and_then(|at| at.checked_duration_since(now))
    }

    /// Length of a list.
    pub fn list_len(&self, key: &str) -> usize {
        self.state.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Number of channels with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        self.state.channels.len()
    }

    fn register(&self, channel: &str) -> broadcast::Receiver<String> {
        // Subscribed under the entry lock so `unregister` cannot drop the
        // sender in between.
        self.state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn unregister(&self, channel: &str, receiver: broadcast::Receiver<String>) {
        drop(receiver);
        if self
            .state
            .channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            trace!(channel = %channel, "Dropped idle memory channel");
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryBackend {
    async fn connect(&self) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(self.store()?))
    }
}

/// A connection handle on a [`MemoryBackend`].
pub struct MemoryStore {
    backend: MemoryBackend,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Get the backend this handle talks to.
    pub fn backend_handle(&self) -> &MemoryBackend {
        &self.backend
    }

    fn state(&self) -> Result<&MemoryState> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let state = &*self.backend.state;
        if state.offline.load(Ordering::Acquire) {
            return Err(StoreError::Connection("memory backend is offline".to_string()));
        }
        Ok(state)
    }

    fn live_value(state: &MemoryState, key: &str) -> Option<String> {
        let now = Instant::now();
        // Lazy expiry, like Redis on access.
        state.values.remove_if(key, |_, slot| slot.is_expired(now));
        state.values.get(key).map(|slot| slot.value.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state()?;
        trace!(key = %key, "GET");
        Ok(Self::live_value(state, key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let state = self.state()?;
        trace!(key = %key, "SET");
        state.values.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let state = self.state()?;
        let now = Instant::now();
        let removed_value = state
            .values
            .remove(key)
            .is_some_and(|(_, slot)| !slot.is_expired(now));
        let removed_list = state.lists.remove(key).is_some();
        Ok(removed_value || removed_list)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let state = self.state()?;
        trace!(key = %key, "RPUSH");
        let mut list = state.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let state = self.state()?;
        trace!(key = %key, "LPOP");
        let head = state.lists.get_mut(key).and_then(|mut list| list.pop_front());
        // Redis drops empty lists.
        state.lists.remove_if(key, |_, list| list.is_empty());
        Ok(head)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u32> {
        let state = self.state()?;
        let receivers = match state.channels.get(channel) {
            Some(sender) => sender.send(payload.to_string()).unwrap_or(0) as u32,
            None => 0,
        };
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(receivers)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let state = self.state()?;
        let now = Instant::now();
        let slot = Slot {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };

        match state.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(slot);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let state = self.state()?;
        let now = Instant::now();
        Ok(state
            .values
            .remove_if(key, |_, slot| !slot.is_expired(now) && slot.value == expected)
            .is_some())
    }

    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let state = self.state()?;
        let now = Instant::now();
        match state.values.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) && slot.value == expected => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.state()?;
        // Subscribers hold their own connection, like a Redis subscriber client.
        let _dedicated = self.backend.store()?;

        let capacity = self.backend.subscription_buffer.unwrap_or(100);
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        // Registered before returning: everything published from now on is seen.
        let mut inbound = self.backend.register(channel);
        let channel_name = channel.to_string();

        debug!(channel = %channel_name, "Subscribed to memory channel");

        let reader_channel = channel_name.clone();
        let backend = self.backend.clone();
        let reader = tokio::spawn(async move {
            'read: loop {
                let payload = tokio::select! {
                    biased;
                    received = inbound.recv() => match received {
                        Ok(payload) => payload,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %reader_channel, skipped = skipped, "Subscriber lagged, messages dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break 'read,
                    },
                    _ = &mut close_rx => break,
                };

                let message = Message {
                    channel: reader_channel.clone(),
                    payload,
                };

                tokio::select! {
                    biased;
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            debug!(channel = %reader_channel, "Subscription receiver dropped");
                            break 'read;
                        }
                    }
                    _ = &mut close_rx => break,
                }
            }

            // Hand over what was published before the unsubscribe.
            while let Ok(payload) = inbound.try_recv() {
                let message = Message {
                    channel: reader_channel.clone(),
                    payload,
                };
                if tx.try_send(message).is_err() {
                    break;
                }
            }

            backend.unregister(&reader_channel, inbound);
            Ok(())
        });

        Ok(Subscription::new(channel_name, rx, close_tx, reader))
    }

    async fn quit(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
