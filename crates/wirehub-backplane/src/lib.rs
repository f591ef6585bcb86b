//! The backplane core: lets multiple server processes, each holding a
//! disjoint set of live client connections, behave as one logical
//! broadcast/group-messaging domain over a shared publish/subscribe bus.
//!
//! Delivery is at-most-once, unordered fan-out. A send succeeds once the
//! local bus client accepts it; nothing is guaranteed about remote receipt.

pub mod connection;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod registry;

pub use connection::{ClientConnection, DeliveryError, OutboundCall};
pub use coordinator::{Backplane, BackplaneConfig};
pub use directory::ConnectionDirectory;
pub use error::BackplaneError;
pub use registry::SubscriptionRegistry;
