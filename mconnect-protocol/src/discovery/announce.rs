//! Identity announcements

use crate::ports::discovery_broadcast_addr;
use crate::{marshal, Identity, ProtocolError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, Instrument, Span};

/// Sends identity datagrams to a fixed destination
///
/// Each call to [`Announcer::announce`] sends exactly one datagram. Failures
/// are returned as is and never retried.
pub struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
    span: Span,
}

impl Announcer {
    /// Create an announcer broadcasting on the discovery port
    pub async fn new() -> Result<Self> {
        Self::bind(discovery_broadcast_addr()).await
    }

    /// Create an announcer sending to `target`
    ///
    /// The local socket is bound to an ephemeral port of the same address
    /// family as the target, with broadcast enabled.
    pub async fn bind(target: SocketAddr) -> Result<Self> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ProtocolError::transport("failed to bind announce socket", e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| ProtocolError::transport("failed to enable broadcast", e))?;

        Ok(Self {
            socket,
            target,
            span: Span::current(),
        })
    }

    /// Log inside `span` instead of the span current at construction
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Local address datagrams are sent from
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Destination of announcements
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one identity datagram
    pub async fn announce(&self, identity: &Identity) -> Result<()> {
        async {
            let bytes = marshal(&identity.to_packet()?)?;

            debug!(
                "Announcing {} ({} bytes) to {}",
                identity.device_id,
                bytes.len(),
                self.target
            );

            self.socket
                .send_to(&bytes, self.target)
                .await
                .map_err(|e| ProtocolError::transport("failed to send announcement", e))?;
            Ok::<_, ProtocolError>(())
        }
        .instrument(self.span.clone())
        .await
    }
}

/// Broadcast `identity` once on the discovery port
///
/// # Examples
///
/// ```no_run
/// use mconnect_protocol::{announce, DeviceType, Identity};
///
/// # async fn example() -> mconnect_protocol::Result<()> {
/// let identity = Identity::new("mconnect-host", "host", DeviceType::Computer, 1716);
/// announce(&identity).await?;
/// # Ok(())
/// # }
/// ```
pub async fn announce(identity: &Identity) -> Result<()> {
    Announcer::new().await?.announce(identity).await
}
