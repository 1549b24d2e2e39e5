//! mconnect Network Packet
//!
//! Every protocol message, over UDP or over the TLS stream, is the same
//! envelope: one JSON object terminated by a single newline.
//!
//! ```text
//! {"id":1700000000000000,"type":"kdeconnect.identity","body":{...}}\n
//! ```
//!
//! - `id`: non-zero identifier, microseconds since the UNIX epoch by default
//! - `type`: message name, e.g. `kdeconnect.identity`, `kdeconnect.pair`
//! - `body`: type-specific payload, nested JSON (never a string)
//!
//! A decoded envelope is accepted only when all three fields are present and
//! `id != 0`, `type != ""`. The same check backs the streaming [`Decoder`] and
//! the one-shot [`unmarshal`].
//!
//! Framing is newline-delimited JSON. No length prefix is read or written.

mod codec;
pub mod identity;

pub use codec::{Decoder, Encoder, MAX_PACKET_SIZE};
pub use identity::{DeviceType, Identity};

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity announcement and handshake packet type
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pairing request/response packet type
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Source of packet ids for packets created with `id == 0`
pub type IdGenerator = fn() -> u64;

/// A protocol packet
///
/// # Examples
///
/// ```
/// use mconnect_protocol::packet::{self, Packet};
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({}));
/// let bytes = packet::marshal(&packet).unwrap();
/// assert_eq!(bytes.last(), Some(&b'\n'));
///
/// let parsed = packet::unmarshal(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "kdeconnect.ping");
/// assert_ne!(parsed.id, 0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet id; `0` means "assign one when encoding"
    pub id: u64,

    /// Packet type, e.g. `kdeconnect.pair`
    pub packet_type: String,

    /// Type-specific payload
    pub body: Value,
}

impl Packet {
    /// Create a packet whose id is assigned by the encoder
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: 0,
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Create a packet with an explicit id
    pub fn with_id(id: u64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Create a packet from any serializable body
    pub fn from_body<T: Serialize>(packet_type: impl Into<String>, body: &T) -> Result<Self> {
        let body = serde_json::to_value(body).map_err(ProtocolError::Encode)?;
        Ok(Self::new(packet_type, body))
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Fail unless the packet has the given type
    pub fn expect_type(&self, packet_type: &str) -> Result<()> {
        if self.is_type(packet_type) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedPacketType {
                expected: packet_type.to_string(),
                actual: self.packet_type.clone(),
            })
        }
    }

    /// Decode the body into a concrete payload type
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body).map_err(ProtocolError::Decode)
    }
}

/// Envelope as it appears on the wire, before completeness validation
#[derive(Debug, Deserialize)]
struct WirePacket {
    #[serde(default, deserialize_with = "deserialize_id")]
    id: Option<u64>,

    #[serde(rename = "type", default)]
    packet_type: Option<String>,

    #[serde(default, deserialize_with = "deserialize_present")]
    body: Option<Value>,
}

impl WirePacket {
    fn is_complete(&self) -> bool {
        is_complete(self.id, self.packet_type.as_deref(), self.body.as_ref())
    }

    fn into_packet(self) -> Result<Packet> {
        if !self.is_complete() {
            return Err(ProtocolError::IncompletePacket);
        }
        match (self.id, self.packet_type, self.body) {
            (Some(id), Some(packet_type), Some(body)) => Ok(Packet {
                id,
                packet_type,
                body,
            }),
            _ => Err(ProtocolError::IncompletePacket),
        }
    }
}

/// Envelope completeness: non-zero id, non-empty type, body present
pub fn is_complete(id: Option<u64>, packet_type: Option<&str>, body: Option<&Value>) -> bool {
    matches!(id, Some(id) if id != 0)
        && matches!(packet_type, Some(t) if !t.is_empty())
        && body.is_some()
}

#[derive(Serialize)]
struct OutgoingPacket<'a> {
    id: u64,
    #[serde(rename = "type")]
    packet_type: &'a str,
    body: &'a Value,
}

/// Serialize a packet into one newline-terminated frame
pub(crate) fn encode_frame(packet: &Packet, next_id: IdGenerator) -> Result<Vec<u8>> {
    if packet.packet_type.is_empty() {
        return Err(ProtocolError::InvalidPacket(
            "packet type not set".to_string(),
        ));
    }

    let id = if packet.id == 0 { next_id() } else { packet.id };

    let mut bytes = serde_json::to_vec(&OutgoingPacket {
        id,
        packet_type: &packet.packet_type,
        body: &packet.body,
    })
    .map_err(ProtocolError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse and validate a single frame
pub(crate) fn decode_frame(data: &[u8]) -> Result<Packet> {
    let wire: WirePacket = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;
    wire.into_packet()
}

/// Encode a packet for datagram use
pub fn marshal(packet: &Packet) -> Result<Vec<u8>> {
    encode_frame(packet, timestamp_id)
}

/// Encode a packet, drawing a missing id from `next_id`
pub fn marshal_with(packet: &Packet, next_id: IdGenerator) -> Result<Vec<u8>> {
    encode_frame(packet, next_id)
}

/// Decode one packet from a complete datagram
///
/// Empty input fails with [`ProtocolError::NoData`], which is distinct from
/// the [`ProtocolError::Decode`] returned for malformed JSON.
pub fn unmarshal(data: &[u8]) -> Result<Packet> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::NoData);
    }
    decode_frame(data)
}

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Microsecond timestamp id, strictly increasing within the process
pub fn timestamp_id() -> u64 {
    let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Accept the id as a number or as a numeric string
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::custom("id must be an unsigned integer")),
        Value::String(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::custom("invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Distinguish `"body": null` (present) from a missing body
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
