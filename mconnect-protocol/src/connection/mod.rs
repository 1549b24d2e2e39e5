//! Connections between devices
//!
//! A connection goes through a fixed sequence of steps, never backwards:
//!
//! 1. **Dial**: TCP connect to the peer's advertised port
//! 2. **Identity**: the dialer sends its identity packet in plaintext
//! 3. **TLS upgrade**: the same socket is wrapped in TLS, the dialer taking
//!    the [`DIALER_TLS_ROLE`] and the acceptor the opposite role
//! 4. **Framed exchange**: packets flow through [`Connection::send`] and
//!    [`Connection::receive`]
//!
//! [`Connector`] performs steps 1 to 3 on the dialing side and
//! [`ConnectionListener`] on the accepting side.

mod connector;
mod tls;

pub use connector::{ConnectionListener, Connector, IncomingConnection};
pub use tls::{TlsRole, DIALER_TLS_ROLE};

use crate::pairing::PacketSender;
use crate::{Decoder, Encoder, ErrorKind, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio_openssl::SslStream;
use tracing::{debug, Instrument, Span};

/// Default bound on establishing the TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the identity exchange and TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by [`Connector`] and [`ConnectionListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// TLS role of the dialing side, the accepting side takes the opposite
    pub tls_role: TlsRole,

    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tls_role: DIALER_TLS_ROLE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A secured connection to a peer
///
/// One send and one receive may be in flight at the same time from different
/// tasks; each direction is serialized by its own lock.
pub struct Connection {
    reader: Mutex<Decoder<BufReader<BoxedReader>>>,
    writer: Mutex<Encoder<BoxedWriter>>,

    /// Set once the connection is unusable, wakes pending sends and receives
    closed: watch::Sender<bool>,

    /// Set once our side of the transport has been shut down
    shut_down: AtomicBool,

    remote_addr: SocketAddr,
    peer_fingerprint: Option<String>,
    span: Span,
}

impl Connection {
    pub(crate) fn from_tls<S>(stream: SslStream<S>, remote_addr: SocketAddr, span: Span) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer_fingerprint = tls::peer_fingerprint(&stream);
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let (closed, _) = watch::channel(false);

        Self {
            reader: Mutex::new(Decoder::new(BufReader::new(reader))),
            writer: Mutex::new(Encoder::new(writer)),
            closed,
            shut_down: AtomicBool::new(false),
            remote_addr,
            peer_fingerprint,
            span,
        }
    }

    /// Address of the peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// SHA-256 fingerprint of the certificate the peer presented
    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Transport failures leave the stream in an unknown state
    fn check_fatal<T>(&self, result: &Result<T>) {
        if let Err(e) = result {
            if e.kind() == ErrorKind::Transport && !self.closed.send_replace(true) {
                debug!("Connection to {} unusable after: {}", self.remote_addr, e);
            }
        }
    }

    /// Send one packet
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        async {
            if self.is_closed() {
                return Err(ProtocolError::Closed);
            }

            let result = tokio::select! {
                _ = self.wait_closed() => Err(ProtocolError::Closed),
                result = async { self.writer.lock().await.encode(packet).await } => result,
            };
            self.check_fatal(&result);

            if result.is_ok() {
                debug!(
                    "Sent packet '{}' to {}",
                    packet.packet_type, self.remote_addr
                );
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }

    /// Wait for the next packet
    ///
    /// Returns [`ProtocolError::Closed`] when the peer closes the stream or
    /// when [`Connection::close`] is called, including while waiting.
    pub async fn receive(&self) -> Result<Packet> {
        async {
            if self.is_closed() {
                return Err(ProtocolError::Closed);
            }

            let result = tokio::select! {
                _ = self.wait_closed() => Err(ProtocolError::Closed),
                result = async { self.reader.lock().await.decode().await } => result,
            };
            self.check_fatal(&result);

            if let Ok(packet) = &result {
                debug!(
                    "Received packet '{}' from {}",
                    packet.packet_type, self.remote_addr
                );
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }

    /// Shut the connection down
    ///
    /// Pending and future sends and receives fail with
    /// [`ProtocolError::Closed`]. The transport is shut down on the first call,
    /// even when the connection was already unusable after a peer close or a
    /// transport error. Calling `close` again does nothing.
    pub async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        async {
            debug!("Closing connection to {}", self.remote_addr);

            let mut writer = self.writer.lock().await;
            match writer.get_mut().shutdown().await {
                Ok(()) => Ok(()),
                Err(e) => match ProtocolError::transport("failed to shut down connection", e) {
                    ProtocolError::Closed => Ok(()),
                    e => Err(e),
                },
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("peer_fingerprint", &self.peer_fingerprint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl PacketSender for Connection {
    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send(packet).await
    }
}
