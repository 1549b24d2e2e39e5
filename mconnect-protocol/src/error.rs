//! Error handling for the mconnect protocol engine
//!
//! Every fallible operation in this crate returns [`ProtocolError`]. The variants
//! are grouped into four layers, reported by [`ProtocolError::kind`]:
//!
//! - **Transport**: socket open/read/write failures. [`ProtocolError::Closed`] is
//!   the distinguished clean-shutdown signal and must end any receive loop.
//! - **Framing**: malformed JSON, incomplete envelopes, oversized frames.
//! - **Protocol**: a well-formed packet of the wrong type for the requested
//!   interpretation (e.g. asking for an identity from a `kdeconnect.pair` packet).
//! - **Security**: TLS handshake and certificate generation failures.
//!
//! Apart from the discovery receive loop, which waits out a few socket errors
//! before giving up, nothing in the engine retries on its own; callers inspect
//! the error and decide whether to keep looping or abort.
//!
//! ```rust
//! use mconnect_protocol::{ErrorKind, ProtocolError};
//!
//! let error = ProtocolError::Closed;
//! assert!(error.is_closed());
//! assert_eq!(error.kind(), ErrorKind::Transport);
//!
//! let error = ProtocolError::IncompletePacket;
//! assert_eq!(error.kind(), ErrorKind::Framing);
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Layer an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Framing,
    Protocol,
    Security,
}

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Raw I/O error without additional context
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error annotated with the operation that failed
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The socket or stream was closed, either locally or by the peer.
    #[error("connection closed")]
    Closed,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode packet: {0}")]
    Decode(#[source] serde_json::Error),

    /// One-shot decode was handed no bytes at all
    #[error("no data")]
    NoData,

    /// JSON parsed, but id, type or body is missing
    #[error("packet incomplete, missing id, type or body")]
    IncompletePacket,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    #[error("unexpected packet type {actual:?}, expected {expected:?}")]
    UnexpectedPacketType { expected: String, actual: String },

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// TLS handshake failure, annotated with the peer it was attempted with
    #[error("{context}: {source}")]
    Handshake {
        context: String,
        #[source]
        source: openssl::ssl::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),
}

impl ProtocolError {
    /// Wrap an I/O error with the operation that produced it
    ///
    /// Errors that signal a closed or reset stream collapse into
    /// [`ProtocolError::Closed`] so receive loops can stop on a single variant.
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;

        match source.kind() {
            IoKind::UnexpectedEof | IoKind::ConnectionReset | IoKind::BrokenPipe => {
                ProtocolError::Closed
            }
            IoKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context.into(), source)),
            _ => ProtocolError::Transport {
                context: context.into(),
                source,
            },
        }
    }

    /// Layer the error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::Transport { .. }
            | ProtocolError::Closed
            | ProtocolError::Timeout(_) => ErrorKind::Transport,
            ProtocolError::Encode(_)
            | ProtocolError::Decode(_)
            | ProtocolError::NoData
            | ProtocolError::IncompletePacket
            | ProtocolError::InvalidPacket(_)
            | ProtocolError::PacketSizeExceeded(_, _) => ErrorKind::Framing,
            ProtocolError::UnexpectedPacketType { .. } | ProtocolError::InvalidIdentity(_) => {
                ErrorKind::Protocol
            }
            ProtocolError::Tls(_)
            | ProtocolError::Handshake { .. }
            | ProtocolError::Certificate(_) => ErrorKind::Security,
        }
    }

    /// Whether this is the clean shutdown signal
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }

    /// Whether a receive loop may continue after this error
    ///
    /// A bad datagram or a malformed packet only spoils that one message. Closed
    /// sockets, TLS failures and raw socket faults end the loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Framing | ErrorKind::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        assert_eq!(ProtocolError::Closed.to_string(), "connection closed");
        assert_eq!(ProtocolError::NoData.to_string(), "no data");
        assert_eq!(
            ProtocolError::IncompletePacket.to_string(),
            "packet incomplete, missing id, type or body"
        );

        let error = ProtocolError::UnexpectedPacketType {
            expected: "kdeconnect.identity".to_string(),
            actual: "kdeconnect.pair".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "unexpected packet type \"kdeconnect.pair\", expected \"kdeconnect.identity\""
        );
    }

    #[test]
    fn test_transport_context() {
        let error = ProtocolError::transport(
            "failed to dial 10.0.0.1:1716",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(error.to_string(), "failed to dial 10.0.0.1:1716: refused");
        assert_eq!(error.kind(), ErrorKind::Transport);
        assert!(!error.is_closed());
    }

    #[test]
    fn test_transport_eof_is_closed() {
        let error = ProtocolError::transport(
            "failed to read packet",
            io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        );
        assert!(error.is_closed());

        let error = ProtocolError::transport(
            "failed to write packet",
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        );
        assert!(error.is_closed());
    }

    #[test]
    fn test_transport_timeout() {
        let error = ProtocolError::transport(
            "connect",
            io::Error::new(io::ErrorKind::TimedOut, "too slow"),
        );
        assert!(matches!(error, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ProtocolError::NoData.kind(), ErrorKind::Framing);
        assert_eq!(
            ProtocolError::PacketSizeExceeded(10, 5).kind(),
            ErrorKind::Framing
        );
        assert_eq!(
            ProtocolError::InvalidIdentity("empty deviceId".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            ProtocolError::Timeout("handshake".into()).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(ProtocolError::IncompletePacket.is_recoverable());
        assert!(ProtocolError::InvalidIdentity("x".into()).is_recoverable());
        assert!(!ProtocolError::Closed.is_recoverable());
        assert!(!ProtocolError::Io(io::Error::other("boom")).is_recoverable());
    }
}
