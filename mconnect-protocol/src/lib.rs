//! mconnect Protocol Implementation
//!
//! A Rust implementation of the KDE Connect device discovery and pairing
//! handshake:
//!
//! - [`packet`]: newline-delimited JSON envelopes and the identity payload
//! - [`crypto`]: self-signed per-device certificates
//! - [`discovery`]: UDP broadcast announce and listen
//! - [`connection`]: dial/accept, plaintext identity exchange, TLS upgrade
//! - [`pairing`]: the `kdeconnect.pair` accept/reject handshake

pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod packet;
pub mod pairing;
pub mod ports;

mod error;

pub use connection::{
    Connection, ConnectionConfig, ConnectionListener, Connector, IncomingConnection, TlsRole,
    DIALER_TLS_ROLE,
};
pub use crypto::DeviceCertificate;
pub use discovery::{announce, Announcer, Discovery, Listener, ListenerConfig};
pub use error::{ErrorKind, ProtocolError, Result};
pub use packet::{
    marshal, unmarshal, timestamp_id, Decoder, DeviceType, Encoder, Identity, Packet,
    PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR,
};
pub use pairing::{PacketSender, PairPacket, PairingHandler, PairingOutcome, PairingState};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;
