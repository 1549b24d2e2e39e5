//! Well-known ports and addresses

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// UDP port used for discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// UDP port used by older versions of the protocol, read-only compatibility
pub const LEGACY_DISCOVERY_PORT: u16 = 1714;

/// Lowest TCP port a device listens on for connections
pub const TCP_PORT_MIN: u16 = 1716;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Destination of identity broadcasts
pub fn discovery_broadcast_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(BROADCAST_ADDR, DISCOVERY_PORT))
}
