use std::time::Duration;

use wirehub_bus::BusError;
use wirehub_core::wire::WireError;

/// Failures surfaced to direct callers of the backplane.
///
/// Only failures that prevent establishing or maintaining local interest
/// reach callers. Best-effort paths — membership acks, per-connection
/// delivery, malformed bus payloads — are logged and absorbed internally, so
/// they have no variant here.
#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("bus connection is closed")]
    BusUnavailable,

    #[error("bus still reconnecting after {0:?}")]
    ReconnectTimeout(Duration),

    #[error("subscribe failed for {subject}: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BusError,
    },

    #[error("publish failed on {subject}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BusError,
    },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BackplaneError {
    /// Worth retrying after the bus recovers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReconnectTimeout(_) | Self::Publish { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BusUnavailable => "bus_unavailable",
            Self::ReconnectTimeout(_) => "reconnect_timeout",
            Self::Subscribe { .. } => "subscribe_failure",
            Self::Publish { .. } => "publish_failure",
            Self::Wire(_) => "wire_error",
        }
    }
}
