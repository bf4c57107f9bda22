//! Dedicated subscriber connections.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{Result, StoreError};

/// A pub/sub message as received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel name, exactly as published to.
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

/// An active subscription on a dedicated connection.
///
/// Messages are read by a background task and buffered in a bounded
/// channel. Dropping the subscription drops the receiver, which stops the
/// reader on its next message; [`Subscription::close`] unsubscribes
/// explicitly and waits for the connection to shut down.
pub struct Subscription {
    receiver: mpsc::Receiver<Message>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Assemble a subscription from its reader task.
    ///
    /// `reader` must stop when `close` fires and report the outcome of
    /// unsubscribing.
    pub fn new(
        channel: impl Into<String>,
        receiver: mpsc::Receiver<Message>,
        close: oneshot::Sender<()>,
        reader: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            receiver,
            handle: SubscriptionHandle {
                channel: channel.into(),
                close: Some(close),
                reader: Some(reader),
            },
        }
    }

    /// Get the channel name.
    pub fn channel(&self) -> &str {
        &self.handle.channel
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Separate the message receiver from the connection handle.
    pub fn into_parts(self) -> (mpsc::Receiver<Message>, SubscriptionHandle) {
        (self.receiver, self.handle)
    }

    /// Unsubscribe and close the dedicated connection.
    pub async fn close(self) -> Result<()> {
        let (_, handle) = self.into_parts();
        handle.close().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Owner side of a subscription's dedicated connection.
pub struct SubscriptionHandle {
    channel: String,
    close: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<Result<()>>>,
}

impl SubscriptionHandle {
    /// Get the channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the reader task is still running.
    pub fn is_active(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Unsubscribe and close the dedicated connection.
    pub async fn close(mut self) -> Result<()> {
        if let Some(close) = self.close.take() {
            // The reader may already have exited on its own.
            let _ = close.send(());
        }

        match self.reader.take() {
            Some(reader) => {
                let outcome = reader
                    .await
                    .map_err(|e| StoreError::PubSub(format!("subscription reader failed: {}", e)))?;
                debug!(channel = %self.channel, "Subscription closed");
                outcome
            }
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}
