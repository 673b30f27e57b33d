//! op-netlink: Generic Netlink engine
//!
//! This crate provides:
//! - Attribute codec with nested attributes and length backpatching
//! - Message framing for netlink and generic netlink headers
//! - Family resolution through the generic netlink controller
//! - Request tracking by sequence number, with timeouts
//! - Batched writes to a non-blocking netlink socket
//! - A connection state machine with a tokio driver

pub mod attr;
pub mod batch;
pub mod config;
pub mod connection;
pub mod error;
pub mod family;
pub mod message;
pub mod reply;
pub mod tracker;
pub mod transport;

pub use attr::{Attr, AttrBuilder, AttrIter, Endian, ValueReader};
pub use batch::BatchWriter;
pub use config::ConnectionConfig;
pub use connection::{ConnectionHandle, ConnectionState, NetlinkConnection};
pub use error::{NetlinkError, Result};
pub use family::{Family, FamilySet};
pub use message::{MessageBuilder, NetlinkHeader, NetlinkMessage, OutgoingMessage};
pub use reply::PendingReply;
pub use tracker::{Expect, ReplyCallback, RequestTracker};
pub use transport::{MemoryTransport, NetlinkSocket, Transport};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::attr::{AttrBuilder, AttrIter, Endian};
    pub use super::connection::{ConnectionHandle, ConnectionState, NetlinkConnection};
    pub use super::error::{NetlinkError, Result};
    pub use super::message::{MessageBuilder, NetlinkMessage};
    pub use super::reply::PendingReply;
    pub use super::tracker::Expect;
}
