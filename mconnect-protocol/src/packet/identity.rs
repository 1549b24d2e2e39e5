//! Device identity
//!
//! The body of `kdeconnect.identity` packets, broadcast during discovery and
//! sent in plaintext at the start of every connection.

use super::{Packet, PACKET_TYPE_IDENTITY};
use crate::{ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};

/// Well-known device types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Computer,
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Convert device type to its wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Computer => "computer",
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a wire string, `None` for types this crate does not know
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "computer" => Some(DeviceType::Computer),
            "desktop" => Some(DeviceType::Desktop),
            "laptop" => Some(DeviceType::Laptop),
            "phone" => Some(DeviceType::Phone),
            "tablet" => Some(DeviceType::Tablet),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

/// Description of a device as exchanged on the wire
///
/// `device_type` stays a plain string so identities from peers using types
/// unknown to [`DeviceType`] still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique, stable device identifier
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    pub device_type: String,

    /// Protocol version the device speaks
    #[serde(default)]
    pub protocol_version: u32,

    /// Packet types this device can receive
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections
    #[serde(default)]
    pub tcp_port: u16,
}

impl Identity {
    /// Create an identity speaking [`PROTOCOL_VERSION`] with no capabilities
    ///
    /// # Examples
    ///
    /// ```
    /// use mconnect_protocol::{DeviceType, Identity};
    ///
    /// let identity = Identity::new("mconnect-host", "host", DeviceType::Computer, 1716);
    /// assert_eq!(identity.device_type, "computer");
    /// ```
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type: device_type.as_str().to_string(),
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Known device type, if the peer used one
    pub fn known_device_type(&self) -> Option<DeviceType> {
        DeviceType::parse(&self.device_type)
    }

    /// Wrap the identity in a `kdeconnect.identity` packet
    pub fn to_packet(&self) -> Result<Packet> {
        Packet::from_body(PACKET_TYPE_IDENTITY, self)
    }

    /// Parse an identity from a `kdeconnect.identity` packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        packet.expect_type(PACKET_TYPE_IDENTITY)?;

        let identity: Identity = packet.body_as()?;
        if identity.device_id.is_empty() {
            return Err(ProtocolError::InvalidIdentity(
                "deviceId must not be empty".to_string(),
            ));
        }
        Ok(identity)
    }
}

impl Packet {
    /// Interpret this packet as an identity
    pub fn as_identity(&self) -> Result<Identity> {
        Identity::from_packet(self)
    }
}
