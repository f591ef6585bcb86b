use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Caller-assigned identifiers. The connection framework owns the id space;
// the backplane never generates these.
string_id!(ConnectionId);
string_id!(UserId);
string_id!(GroupName);

/// Identity of one server process in the cluster.
///
/// Generated once at coordinator construction, carried only as the origin
/// field of group commands and in diagnostics — never used for addressing.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerName(String);

impl ServerName {
    /// `<hostname>_<unique suffix>`.
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());
        Self(format!("{host}_{}", Uuid::now_v7()))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_preserve_raw_value() {
        let id = ConnectionId::new("conn-42");
        assert_eq!(id.as_str(), "conn-42");
        assert_eq!(id.to_string(), "conn-42");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let group: GroupName = "room:lobby".parse().unwrap();
        assert_eq!(group.as_str(), "room:lobby");
        let user = UserId::new(String::from("u1"));
        assert_eq!(user, "u1".parse().unwrap());
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConnectionId::new("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");
        let parsed: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn server_names_are_unique() {
        let a = ServerName::generate();
        let b = ServerName::generate();
        assert_ne!(a, b);
        assert!(a.as_str().contains('_'), "got: {a}");
    }
}
