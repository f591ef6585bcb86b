//! The publish/subscribe transport boundary consumed by the backplane.
//!
//! The backplane never talks to a broker directly; it goes through the [`Bus`]
//! trait. Subscriptions hand back an explicit message channel consumed by one
//! dedicated task per subject — no callback registration, no shared closures.
//!
//! [`memory`] provides the in-process implementation: the reference for
//! transport semantics, the test double for multi-node scenarios, and the
//! demo transport.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::{MemoryBus, MemoryBusHub};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection is closed")]
    Closed,

    #[error("request on {subject} timed out after {timeout:?}")]
    RequestTimeout { subject: String, timeout: Duration },
}

/// One message delivered to a subscription.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Subject to publish a reply on, set for request-style messages.
    pub reply_to: Option<String>,
}

/// Runs when a subscription is dropped, deregistering it from the transport.
pub struct UnsubscribeGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl UnsubscribeGuard {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// An open subscription: a subject plus the channel its messages arrive on.
///
/// Dropping the subscription deregisters it; `close` exists for callers that
/// want the teardown to be explicit.
pub struct BusSubscription {
    subject: String,
    messages: mpsc::Receiver<BusMessage>,
    _unsub: UnsubscribeGuard,
}

impl BusSubscription {
    pub fn new(
        subject: impl Into<String>,
        messages: mpsc::Receiver<BusMessage>,
        unsub: UnsubscribeGuard,
    ) -> Self {
        Self {
            subject: subject.into(),
            messages,
            _unsub: unsub,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the transport has dropped the channel.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.messages.recv().await
    }

    pub fn close(self) {}
}

/// A connection to the message bus shared by all server processes.
///
/// Publish is fire-and-forget: success means the local bus client accepted
/// the message, not that any remote process received it.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Open a subscription. Once this returns, matching publishes are
    /// deliverable to the returned channel.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError>;

    /// Publish and wait for the first reply on an ephemeral inbox subject.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError>;

    /// Permanently closed — operations will not recover.
    fn is_closed(&self) -> bool;

    /// Transiently down with reconnection in progress.
    fn is_reconnecting(&self) -> bool;

    async fn flush(&self) -> Result<(), BusError>;
}
