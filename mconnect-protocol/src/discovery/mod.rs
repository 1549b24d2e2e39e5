//! Device Discovery
//!
//! Devices announce themselves by broadcasting `kdeconnect.identity` packets
//! over UDP and listen for the announcements of others.
//!
//! ## Discovery Protocol
//!
//! 1. **Announce**: send one identity datagram to `255.255.255.255:1716`
//! 2. **Listen**: receive identity datagrams from other devices
//! 3. **Connect**: dial the TCP port the discovered device advertised
//!
//! Announcing periodically is left to the caller. The listener reports every
//! datagram it decodes, repeats included; de-duplication is up to whoever
//! consumes [`Listener::devices`].
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Legacy port: UDP 1714, listened on for compatibility with older peers

mod announce;
mod listener;

pub use announce::{announce, Announcer};
pub use listener::{Listener, ListenerConfig};

use crate::{Identity, Packet};
use std::net::SocketAddr;

/// Size of the datagram receive buffer
pub const DISCOVERY_BUFFER_SIZE: usize = 4096;

/// A device announcement received by a [`Listener`]
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    /// The packet as it arrived
    pub packet: Packet,

    /// Identity decoded from the packet body
    pub identity: Identity,

    /// Address the datagram was sent from
    pub from: SocketAddr,
}
