use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wirehub_core::ids::{ConnectionId, GroupName, UserId};

/// A method call handed to one client connection.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundCall {
    pub method: String,
    /// Pre-serialized argument payloads, opaque to the backplane.
    pub args: Vec<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    QueueFull,

    #[error("connection closed")]
    Closed,
}

/// The backplane's view of one externally-owned client connection.
///
/// The connection framework creates this wrapper when a client attaches and
/// consumes the returned receiver to push calls down the wire. The group set
/// is owned by the backplane; the abort token is owned by the framework and
/// only ever observed here.
pub struct ClientConnection {
    id: ConnectionId,
    user_id: Option<UserId>,
    groups: Mutex<HashSet<GroupName>>,
    outbound: mpsc::Sender<OutboundCall>,
    abort: CancellationToken,
}

impl ClientConnection {
    pub fn new(
        id: ConnectionId,
        user_id: Option<UserId>,
        queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundCall>) {
        let (tx, rx) = mpsc::channel(queue);
        let conn = Arc::new(Self {
            id,
            user_id,
            groups: Mutex::new(HashSet::new()),
            outbound: tx,
            abort: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Cancelled by the connection framework when the client is going away.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Hand a call to the connection without blocking the fan-out. A full or
    /// closed queue fails only this connection.
    pub fn deliver(&self, call: OutboundCall) -> Result<(), DeliveryError> {
        match self.outbound.try_send(call) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Snapshot of the joined groups.
    pub fn groups(&self) -> Vec<GroupName> {
        self.groups.lock().iter().cloned().collect()
    }

    /// True if the group was newly added.
    pub(crate) fn add_group(&self, group: &GroupName) -> bool {
        self.groups.lock().insert(group.clone())
    }

    /// True if the connection was a member.
    pub(crate) fn remove_group(&self, group: &GroupName) -> bool {
        self.groups.lock().remove(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundCall>) {
        ClientConnection::new(ConnectionId::new(id), None, 4)
    }

    #[test]
    fn deliver_reaches_receiver() {
        let (c, mut rx) = conn("c1");
        c.deliver(OutboundCall {
            method: "ping".into(),
            args: vec![],
        })
        .unwrap();

        let call = rx.try_recv().unwrap();
        assert_eq!(call.method, "ping");
    }

    #[test]
    fn deliver_fails_when_queue_full() {
        let (c, _rx) = conn("c1");
        for _ in 0..4 {
            c.deliver(OutboundCall {
                method: "m".into(),
                args: vec![],
            })
            .unwrap();
        }
        let err = c
            .deliver(OutboundCall {
                method: "m".into(),
                args: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, DeliveryError::QueueFull));
    }

    #[test]
    fn deliver_fails_when_receiver_dropped() {
        let (c, rx) = conn("c1");
        drop(rx);
        let err = c
            .deliver(OutboundCall {
                method: "m".into(),
                args: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Closed));
    }

    #[test]
    fn group_membership_is_idempotent() {
        let (c, _rx) = conn("c1");
        let g = GroupName::new("g");

        assert!(c.add_group(&g));
        assert!(!c.add_group(&g));
        assert_eq!(c.groups(), vec![g.clone()]);

        assert!(c.remove_group(&g));
        assert!(!c.remove_group(&g));
        assert!(c.groups().is_empty());
    }

    #[test]
    fn abort_is_observable() {
        let (c, _rx) = conn("c1");
        assert!(!c.is_aborted());
        c.abort_token().cancel();
        assert!(c.is_aborted());
    }
}
