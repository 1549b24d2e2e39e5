//! TLS upgrade of an established TCP stream
//!
//! The protocol inverts the usual roles: the side that opened the TCP
//! connection acts as the TLS server. Neither side validates the peer's
//! self-signed certificate; it is only recorded so a higher layer can decide
//! whether to trust it.

use crate::{DeviceCertificate, ProtocolError, Result};
use openssl::ssl::{
    Ssl, SslAcceptor, SslConnector, SslContextRef, SslMethod, SslVerifyMode, SslVersion,
};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{debug, warn};

/// Cipher suites offered for TLS 1.2 and below, matching the EC device keys
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Which side of the TLS handshake a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// TLS role taken by the side that dialed the TCP connection
pub const DIALER_TLS_ROLE: TlsRole = TlsRole::Server;

impl TlsRole {
    /// Role of the other end of the handshake
    pub fn opposite(self) -> Self {
        match self {
            TlsRole::Client => TlsRole::Server,
            TlsRole::Server => TlsRole::Client,
        }
    }
}

impl fmt::Display for TlsRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsRole::Client => write!(f, "client"),
            TlsRole::Server => write!(f, "server"),
        }
    }
}

/// Both TLS contexts for one device certificate
pub(crate) struct TlsContext {
    acceptor: SslAcceptor,
    connector: SslConnector,
}

impl TlsContext {
    pub(crate) fn new(certificate: &DeviceCertificate) -> Result<Self> {
        Ok(Self {
            acceptor: create_acceptor(certificate)?,
            connector: create_connector(certificate)?,
        })
    }

    fn context(&self, role: TlsRole) -> &SslContextRef {
        match role {
            TlsRole::Server => self.acceptor.context(),
            TlsRole::Client => self.connector.context(),
        }
    }

    /// Run the handshake on `stream` in `role`
    ///
    /// On failure the stream is dropped, closing the socket.
    pub(crate) async fn upgrade<S>(
        &self,
        stream: S,
        role: TlsRole,
        peer: SocketAddr,
        handshake_timeout: Duration,
    ) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Starting TLS handshake as {} with {}", role, peer);

        let ssl = Ssl::new(self.context(role))?;
        let mut tls_stream = SslStream::new(ssl, stream)?;

        let handshake = async {
            match role {
                TlsRole::Server => Pin::new(&mut tls_stream).accept().await,
                TlsRole::Client => Pin::new(&mut tls_stream).connect().await,
            }
        };

        timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| {
                warn!("TLS handshake with {} timed out", peer);
                ProtocolError::Timeout(format!("TLS handshake with {}", peer))
            })?
            .map_err(|source| {
                warn!("TLS handshake with {} failed: {}", peer, source);
                ProtocolError::Handshake {
                    context: format!("TLS handshake with {} as {} failed", peer, role),
                    source,
                }
            })?;

        debug!("TLS established with {} as {}", peer, role);
        Ok(tls_stream)
    }
}

/// Fingerprint of the certificate the peer presented, if any
pub(crate) fn peer_fingerprint<S>(stream: &SslStream<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite,
{
    let cert = stream.ssl().peer_certificate()?;
    let der = cert.to_der().ok()?;
    Some(DeviceCertificate::calculate_fingerprint(&der))
}

fn create_acceptor(certificate: &DeviceCertificate) -> Result<SslAcceptor> {
    let (cert, key) = certificate.tls_credentials()?;

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // Ask for the client certificate so it can be fingerprinted, accept any
    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;

    Ok(builder.build())
}

fn create_connector(certificate: &DeviceCertificate) -> Result<SslConnector> {
    let (cert, key) = certificate.tls_credentials()?;

    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // Self-signed peers, trust on first use
    builder.set_verify(SslVerifyMode::NONE);

    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;

    Ok(builder.build())
}
