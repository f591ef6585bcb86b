//! Wire records exchanged between server processes.
//!
//! Both records are ephemeral: they exist only as bus payloads and are never
//! persisted. The binary codec is bincode; only the record shapes matter to
//! peers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("malformed payload: {0}")]
    Decode(#[source] bincode::Error),
}

/// A method call fanned out to client connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: Option<String>,
    pub method: String,
    /// Pre-serialized argument payloads, opaque to the backplane.
    pub args: Vec<Vec<u8>>,
    pub excluded_connection_ids: Option<Vec<String>>,
    /// Reserved for caller-addressed results; unused by the send variants.
    pub return_channel: Option<String>,
}

impl Invocation {
    pub fn new(method: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            invocation_id: None,
            method: method.into(),
            args,
            excluded_connection_ids: None,
            return_channel: None,
        }
    }

    pub fn excluding(method: impl Into<String>, args: Vec<Vec<u8>>, excluded: Vec<String>) -> Self {
        let excluded = if excluded.is_empty() { None } else { Some(excluded) };
        Self {
            excluded_connection_ids: excluded,
            ..Self::new(method, args)
        }
    }

    pub fn is_excluded(&self, connection_id: &str) -> bool {
        self.excluded_connection_ids
            .as_deref()
            .is_some_and(|ids| ids.iter().any(|id| id == connection_id))
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        bincode::serialize(self).map(Bytes::from).map_err(WireError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(payload).map_err(WireError::Decode)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupAction {
    Add = 0,
    Remove = 1,
}

/// A group membership change, replicated to whichever process owns the
/// connection. `id` correlates the ack reply and is only unique per
/// originating process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupCommand {
    pub id: u32,
    pub server_name: String,
    pub action: GroupAction,
    pub group: String,
    pub connection_id: String,
}

impl GroupCommand {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        bincode::serialize(self).map(Bytes::from).map_err(WireError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(payload).map_err(WireError::Decode)
    }

    /// Payload of the ack reply: the command id as text.
    pub fn ack_payload(&self) -> Bytes {
        Bytes::from(self.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_roundtrip() {
        let inv = Invocation::excluding(
            "ping",
            vec![b"\"hello\"".to_vec()],
            vec!["c1".into(), "c2".into()],
        );
        let bytes = inv.encode().unwrap();
        let decoded = Invocation::decode(&bytes).unwrap();
        assert_eq!(decoded, inv);
    }

    #[test]
    fn empty_exclusion_list_collapses_to_none() {
        let inv = Invocation::excluding("m", vec![], vec![]);
        assert_eq!(inv.excluded_connection_ids, None);
    }

    #[test]
    fn exclusion_check() {
        let inv = Invocation::excluding("m", vec![], vec!["c1".into()]);
        assert!(inv.is_excluded("c1"));
        assert!(!inv.is_excluded("c2"));

        let plain = Invocation::new("m", vec![]);
        assert!(!plain.is_excluded("c1"));
    }

    #[test]
    fn group_command_roundtrip() {
        let cmd = GroupCommand {
            id: 7,
            server_name: "host_a".into(),
            action: GroupAction::Remove,
            group: "g".into(),
            connection_id: "c1".into(),
        };
        let bytes = cmd.encode().unwrap();
        assert_eq!(GroupCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn ack_payload_is_textual_id() {
        let cmd = GroupCommand {
            id: 41,
            server_name: "s".into(),
            action: GroupAction::Add,
            group: "g".into(),
            connection_id: "c".into(),
        };
        assert_eq!(&cmd.ack_payload()[..], b"41");
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(Invocation::decode(&[0xff, 0x01, 0x02]).is_err());
        assert!(GroupCommand::decode(b"not a command").is_err());
    }
}
