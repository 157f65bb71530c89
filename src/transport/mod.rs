//! Identity-addressed overlay transport.
//!
//! The shell core consumes a narrow surface: identities with truncated-hash
//! addresses, destinations in IN/OUT roles, links with packets, requests and
//! receipts, and path discovery. This module provides that surface over
//! length-prefixed JSON frames on TCP peer connections.

mod frame;
mod identity;
mod link;
mod node;

pub use identity::{
    destination_hash, AddressError, AddressHash, Identity, TRUNCATED_HASH_BITS,
    TRUNCATED_HASH_BYTES,
};
pub use link::{Link, LinkId, LinkStatus, PacketReceipt, ReceiptStatus, RequestReceipt};
pub use node::{AccessPolicy, Transport, TransportConfig, TransportError};

use serde_json::Value;

/// Largest payload a link carries in one frame.
pub const LINK_MDU: usize = 4096;

/// Inbound traffic, delivered on the node's event channel so a single event
/// loop drives all link callbacks.
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote initiator opened a link to one of our IN destinations.
    LinkEstablished(Link),
    /// A link reached CLOSED, locally or remotely.
    LinkClosed(Link),
    /// The initiator disclosed its identity on a link.
    RemoteIdentified { link: Link, identity: AddressHash },
    /// A reliable request; answer with [`Link::respond`].
    Request {
        link: Link,
        id: u64,
        path: String,
        data: Value,
    },
    /// An unreliable packet arrived.
    Packet { link: Link, payload: Vec<u8> },
}
