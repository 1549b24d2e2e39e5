//! Dialing and accepting connections

use super::tls::TlsContext;
use super::{Connection, ConnectionConfig};
use crate::packet::MAX_PACKET_SIZE;
use crate::{unmarshal, DeviceCertificate, Encoder, Identity, ProtocolError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument, Span};

/// Opens connections to other devices
///
/// # Examples
///
/// ```no_run
/// use mconnect_protocol::{Connector, DeviceCertificate, DeviceType, Identity};
///
/// # async fn example() -> mconnect_protocol::Result<()> {
/// let certificate = DeviceCertificate::generate("mconnect-host")?;
/// let identity = Identity::new("mconnect-host", "host", DeviceType::Computer, 1716);
///
/// let connector = Connector::new(identity, &certificate)?;
/// let connection = connector.dial("192.168.1.20:1716").await?;
/// connection.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connector {
    identity: Identity,
    tls: TlsContext,
    config: ConnectionConfig,
    span: Span,
}

impl Connector {
    pub fn new(identity: Identity, certificate: &DeviceCertificate) -> Result<Self> {
        Ok(Self {
            identity,
            tls: TlsContext::new(certificate)?,
            config: ConnectionConfig::default(),
            span: Span::current(),
        })
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Log inside `span` instead of the span current at construction
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Connect to `target`, send our identity and upgrade to TLS
    ///
    /// Any failure is terminal for the attempt; the socket is closed and
    /// nothing is retried.
    pub async fn dial(&self, target: impl ToSocketAddrs) -> Result<Connection> {
        async {
            let stream = timeout(self.config.connect_timeout, TcpStream::connect(target))
                .await
                .map_err(|_| ProtocolError::Timeout("connect".to_string()))?
                .map_err(|e| ProtocolError::transport("failed to dial", e))?;
            let peer = stream.peer_addr()?;
            debug!("Connected to {}", peer);

            let stream = timeout(
                self.config.handshake_timeout,
                self.handshake(stream, peer),
            )
            .await
            .map_err(|_| ProtocolError::Timeout(format!("handshake with {}", peer)))??;

            info!("Connection to {} established", peer);
            Ok(Connection::from_tls(stream, peer, self.span.clone()))
        }
        .instrument(self.span.clone())
        .await
    }

    async fn handshake(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<tokio_openssl::SslStream<TcpStream>> {
        Encoder::new(&mut stream)
            .encode(&self.identity.to_packet()?)
            .await?;
        debug!("Identity sent to {}", peer);

        self.tls
            .upgrade(stream, self.config.tls_role, peer, self.config.handshake_timeout)
            .await
    }
}

/// Accepts connections from devices that dial us
pub struct ConnectionListener {
    listener: TcpListener,
    tls: Arc<TlsContext>,
    config: ConnectionConfig,
    span: Span,
}

impl ConnectionListener {
    /// Listen for TCP connections on `addr`
    pub async fn bind(addr: impl ToSocketAddrs, certificate: &DeviceCertificate) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProtocolError::transport("failed to bind connection listener", e))?;
        info!("Accepting connections on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            tls: Arc::new(TlsContext::new(certificate)?),
            config: ConnectionConfig::default(),
            span: Span::current(),
        })
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Log inside `span` instead of the span current at construction
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection and complete its handshake
    ///
    /// Returns the connection and the identity the peer sent. Nothing else is
    /// accepted until the handshake finishes; use
    /// [`ConnectionListener::accept_incoming`] to handshake concurrently.
    pub async fn accept(&self) -> Result<(Connection, Identity)> {
        self.accept_incoming().await?.handshake().await
    }

    /// Accept the next TCP connection without handshaking
    pub async fn accept_incoming(&self) -> Result<IncomingConnection> {
        let (stream, peer) = self
            .listener
            .accept()
            .instrument(self.span.clone())
            .await
            .map_err(|e| ProtocolError::transport("failed to accept connection", e))?;
        self.span.in_scope(|| debug!("TCP connection accepted from {}", peer));

        Ok(IncomingConnection {
            stream,
            peer,
            tls: self.tls.clone(),
            config: self.config.clone(),
            span: self.span.clone(),
        })
    }
}

/// A TCP connection accepted by a [`ConnectionListener`], not yet handshaken
pub struct IncomingConnection {
    stream: TcpStream,
    peer: SocketAddr,
    tls: Arc<TlsContext>,
    config: ConnectionConfig,
    span: Span,
}

impl IncomingConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Read the dialer's plaintext identity, then run the TLS handshake in
    /// the role opposite to the dialer's
    ///
    /// The whole exchange is bounded by the handshake timeout.
    pub async fn handshake(self) -> Result<(Connection, Identity)> {
        let peer = self.peer;
        let span = self.span.clone();
        let handshake_timeout = self.config.handshake_timeout;

        async move {
            let (stream, identity, span) = timeout(handshake_timeout, self.exchange())
                .await
                .map_err(|_| {
                    warn!("Handshake with {} timed out", peer);
                    ProtocolError::Timeout(format!("handshake with {}", peer))
                })??;

            info!(
                "Connection from {} ({}) at {} established",
                identity.device_name, identity.device_id, peer
            );
            Ok((Connection::from_tls(stream, peer, span), identity))
        }
        .instrument(span)
        .await
    }

    async fn exchange(self) -> Result<(tokio_openssl::SslStream<TcpStream>, Identity, Span)> {
        let Self {
            mut stream,
            peer,
            tls,
            config,
            span,
        } = self;

        let frame = read_plaintext_frame(&mut stream).await?;
        let identity = unmarshal(&frame)?.as_identity()?;
        debug!(
            "Received plaintext identity of {} from {}",
            identity.device_id, peer
        );

        let stream = tls
            .upgrade(
                stream,
                config.tls_role.opposite(),
                peer,
                config.handshake_timeout,
            )
            .await?;
        Ok((stream, identity, span))
    }
}

/// Read one newline-terminated frame without reading past it
///
/// Buffered reads would swallow the start of the TLS handshake that follows.
async fn read_plaintext_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut frame = Vec::new();
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| ProtocolError::transport("failed to read identity", e))?;
        frame.push(byte);

        if byte == b'\n' {
            return Ok(frame);
        }
        if frame.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(frame.len(), MAX_PACKET_SIZE));
        }
    }
}
