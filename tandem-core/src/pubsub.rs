//! Topic publish/subscribe.

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tandem_store::{Message, StoreError, Subscription, SubscriptionHandle};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::keys::channel_key;
use crate::{Result, Tandem, TandemError};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(0);

/// Bookkeeping of one subscribed channel.
pub(crate) enum ActiveSubscription {
    /// Handshake in flight; the ticket identifies the reservation.
    Pending(u64),
    Live(SubscriptionHandle),
}

impl ActiveSubscription {
    /// Whether the entry blocks another subscription on its channel.
    fn is_taken(&self) -> bool {
        match self {
            Self::Pending(_) => true,
            Self::Live(handle) => handle.is_active(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, Self::Live(handle) if handle.is_active())
    }

    async fn close(self) -> tandem_store::Result<()> {
        match self {
            Self::Pending(_) => Ok(()),
            Self::Live(handle) => handle.close().await,
        }
    }
}

/// Close every subscription in `subscriptions`. Returns how many there were.
///
/// Pending handshakes are dropped from the map; they close their own
/// connection once they find their reservation gone.
pub(crate) async fn close_all(subscriptions: &Mutex<HashMap<String, ActiveSubscription>>) -> usize {
    let drained: Vec<(String, ActiveSubscription)> =
        subscriptions.lock().await.drain().collect();
    let count = drained.len();

    for (channel, subscription) in drained {
        if let Err(e) = subscription.close().await {
            warn!(channel = %channel, error = %e, "Subscription close failed");
        }
    }
    count
}

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    /// Channel name, without namespace.
    pub channel: String,
    /// Decoded payload.
    pub data: T,
}

/// Typed stream of messages received on one channel.
///
/// Ends once the channel is unsubscribed (buffered messages are yielded
/// first) or its connection drops. Payloads that fail to decode are
/// yielded as [`TandemError::Serialization`].
#[derive(Debug)]
pub struct ChannelStream<T> {
    channel: String,
    receiver: mpsc::Receiver<Message>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ChannelStream<T> {
    fn new(channel: &str, receiver: mpsc::Receiver<Message>) -> Self {
        Self {
            channel: channel.to_string(),
            receiver,
            _marker: PhantomData,
        }
    }

    /// Get the channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Option<Result<Delivery<T>>> {
        let message = self.receiver.recv().await?;
        Some(self.decode(message))
    }

    fn decode(&self, message: Message) -> Result<Delivery<T>> {
        let data = serde_json::from_str(&message.payload)?;
        Ok(Delivery {
            channel: self.channel.clone(),
            data,
        })
    }
}

impl<T: DeserializeOwned> Stream for ChannelStream<T> {
    type Item = Result<Delivery<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(message)) => Poll::Ready(Some(self.decode(message))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Tandem {
    /// Publish `data` on `channel`.
    ///
    /// Fire-and-forget: only subscribers connected at this moment receive
    /// it. Returns the receiver count reported by the store.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, channel: &str, data: &T) -> Result<u32> {
        let payload = serde_json::to_string(data)?;
        let key = channel_key(channel);
        let receivers = self
            .call(|store| async move { store.publish(&key, &payload).await })
            .await?;
        debug!(channel = %channel, receivers = receivers, "Broadcast sent");
        Ok(receivers)
    }

    /// Subscribe to `channel`, invoking `handler(data, channel)` for each
    /// message in arrival order.
    ///
    /// Returns once the subscription is established; messages published
    /// before that are never delivered. Fails with
    /// [`TandemError::AlreadySubscribed`] when this instance already
    /// listens on `channel`. Undecodable messages are logged and skipped.
    pub async fn subscribe<T, F, Fut>(&self, channel: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stream = self.stream::<T>(channel).await?;

        tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                match delivery {
                    Ok(Delivery { channel, data }) => handler(data, channel).await,
                    Err(e) => {
                        warn!(channel = %stream.channel(), error = %e, "Dropping undecodable message");
                    }
                }
            }
            debug!(channel = %stream.channel(), "Delivery task finished");
        });

        Ok(())
    }

    /// Subscribe to `channel` and receive its messages as a stream.
    ///
    /// Same registration rules as [`Tandem::subscribe`].
    pub async fn stream<T: DeserializeOwned>(&self, channel: &str) -> Result<ChannelStream<T>> {
        let ticket = self.reserve(channel).await?;

        // The map is not locked across the handshake.
        let subscription = match self.open_subscription(channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let mut subscriptions = self.inner.subscriptions.lock().await;
                if matches!(subscriptions.get(channel), Some(ActiveSubscription::Pending(t)) if *t == ticket) {
                    subscriptions.remove(channel);
                }
                return Err(e);
            }
        };

        let (receiver, handle) = subscription.into_parts();
        {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            if matches!(subscriptions.get(channel), Some(ActiveSubscription::Pending(t)) if *t == ticket) {
                subscriptions.insert(channel.to_string(), ActiveSubscription::Live(handle));
                info!(channel = %channel, "Subscribed");
                return Ok(ChannelStream::new(channel, receiver));
            }
        }

        // Unsubscribed or disconnected while the handshake ran.
        debug!(channel = %channel, "Subscription cancelled during handshake");
        if let Err(e) = handle.close().await {
            warn!(channel = %channel, error = %e, "Subscription close failed");
        }
        Err(TandemError::Connection(StoreError::Closed))
    }

    /// Reserve `channel` for a handshake.
    async fn reserve(&self, channel: &str) -> Result<u64> {
        let mut subscriptions = self.inner.subscriptions.lock().await;

        if let Some(existing) = subscriptions.get(channel) {
            if existing.is_taken() {
                return Err(TandemError::AlreadySubscribed(channel.to_string()));
            }
            debug!(channel = %channel, "Replacing dead subscription");
        }

        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        subscriptions.insert(channel.to_string(), ActiveSubscription::Pending(ticket));
        Ok(ticket)
    }

    async fn open_subscription(&self, channel: &str) -> Result<Subscription> {
        let conn = self.connection().await?;
        let result = conn.store.subscribe(&channel_key(channel)).await;
        self.inner.lifecycle.observe(&conn, result).await
    }

    /// Unsubscribe from `channel` and close its connection.
    ///
    /// No-op when this instance is not subscribed to it. A handshake still
    /// in flight is cancelled.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let removed = self.inner.subscriptions.lock().await.remove(channel);
        let Some(subscription) = removed else {
            return Ok(());
        };

        subscription.close().await?;
        info!(channel = %channel, "Unsubscribed");
        Ok(())
    }

    /// Whether this instance has a live subscription on `channel`.
    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(channel)
            .is_some_and(ActiveSubscription::is_live)
    }
}
