//! In-process bus implementation.
//!
//! A [`MemoryBusHub`] plays the broker: every [`MemoryBus`] client created
//! from the same hub sees the others' publishes, exactly as processes
//! connected to a real broker would. Delivery is immediate and in-process,
//! which makes this the reference for transport semantics: once `subscribe`
//! returns, matching publishes are deliverable.
//!
//! Clients expose `set_closed`/`set_reconnecting` so connectivity failures
//! can be injected in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Bus, BusError, BusMessage, BusSubscription, UnsubscribeGuard};

const INBOX_PREFIX: &str = "_inbox.";
const SUBSCRIPTION_QUEUE: usize = 256;

struct SubjectSender {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

/// The shared in-process broker.
pub struct MemoryBusHub {
    subjects: DashMap<String, Vec<SubjectSender>>,
    next_sub_id: AtomicU64,
}

impl MemoryBusHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subjects: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
        })
    }

    /// A new client of this hub, standing in for one server process's bus
    /// connection.
    pub fn client(self: &Arc<Self>) -> Arc<MemoryBus> {
        Arc::new(MemoryBus {
            hub: Arc::clone(self),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Number of open subscriptions for a subject.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects.get(subject).map_or(0, |s| s.len())
    }

    fn deliver(&self, message: BusMessage) {
        let Some(mut senders) = self.subjects.get_mut(&message.subject) else {
            return;
        };
        senders.retain(|s| match s.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subject = %message.subject, "subscriber queue full, dropping message");
                true
            }
            // Closed channel: the subscription's receiver is gone.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let empty = senders.is_empty();
        drop(senders);
        if empty {
            self.subjects.remove_if(&message.subject, |_, v| v.is_empty());
        }
    }

    fn subscribe(self: &Arc<Self>, subject: &str) -> BusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subjects
            .entry(subject.to_owned())
            .or_default()
            .push(SubjectSender { id, tx });

        let hub = Arc::clone(self);
        let unsub_subject = subject.to_owned();
        BusSubscription::new(
            subject,
            rx,
            UnsubscribeGuard::new(move || hub.unsubscribe(&unsub_subject, id)),
        )
    }

    fn unsubscribe(&self, subject: &str, id: u64) {
        let Some(mut senders) = self.subjects.get_mut(subject) else {
            return;
        };
        senders.retain(|s| s.id != id);
        let empty = senders.is_empty();
        drop(senders);
        if empty {
            self.subjects.remove_if(subject, |_, v| v.is_empty());
        }
    }

    async fn request(
        self: &Arc<Self>,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let inbox = format!("{INBOX_PREFIX}{}", Uuid::now_v7());
        let mut reply_sub = self.subscribe(&inbox);
        self.deliver(BusMessage {
            subject: subject.to_owned(),
            payload,
            reply_to: Some(inbox),
        });

        match tokio::time::timeout(timeout, reply_sub.recv()).await {
            Ok(Some(reply)) => Ok(reply.payload),
            Ok(None) | Err(_) => Err(BusError::RequestTimeout {
                subject: subject.to_owned(),
                timeout,
            }),
        }
    }
}

/// One process's connection to the shared hub.
pub struct MemoryBus {
    hub: Arc<MemoryBusHub>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
}

impl MemoryBus {
    /// Simulate a permanent close. Not reversible in real brokers; tests may
    /// flip it back.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    /// Simulate a reconnect in progress.
    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.ensure_open()?;
        self.hub.deliver(BusMessage {
            subject: subject.to_owned(),
            payload,
            reply_to: None,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError> {
        self.ensure_open()?;
        Ok(self.hub.subscribe(subject))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        self.ensure_open()?;
        self.hub.request(subject, payload, timeout).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<(), BusError> {
        // In-process delivery is synchronous; nothing is buffered.
        self.ensure_open()
    }
}
