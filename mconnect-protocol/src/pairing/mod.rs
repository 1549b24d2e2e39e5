//! Device Pairing
//!
//! Once a connection is secured, either side may ask to pair by sending
//! `kdeconnect.pair` with `pair: true`. The other side answers with
//! `pair: true` to accept or `pair: false` to reject.
//!
//! ## Pairing Protocol
//!
//! 1. **Request**: device A sends `{"pair": true}`
//! 2. **Accept**: device B, not yet paired, answers `{"pair": true}` once
//! 3. **Done**: device A sees the answer to its own request and does not reply
//!
//! Trust decisions are not persisted here; [`PairingHandler`] only tracks the
//! state of one connection and reports each outcome.
//!
//! ## Usage
//!
//! ```no_run
//! use mconnect_protocol::{Connection, PairingHandler, PairingOutcome};
//!
//! # async fn example(connection: Connection) -> mconnect_protocol::Result<()> {
//! let mut pairing = PairingHandler::new();
//! connection.send(&pairing.request_pairing()).await?;
//!
//! loop {
//!     let packet = connection.receive().await?;
//!     if pairing.handle(&connection, &packet).await? == PairingOutcome::Accepted {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::{Packet, Result, PACKET_TYPE_PAIR};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Anything packets can be sent through
#[async_trait]
pub trait PacketSender: Send + Sync {
    async fn send_packet(&self, packet: &Packet) -> Result<()>;
}

/// Body of `kdeconnect.pair` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPacket {
    pub pair: bool,
}

impl PairPacket {
    /// Request or accept pairing
    pub fn request() -> Packet {
        PairPacket { pair: true }.to_packet()
    }

    /// Reject pairing
    pub fn reject() -> Packet {
        PairPacket { pair: false }.to_packet()
    }

    pub fn to_packet(self) -> Packet {
        Packet::new(PACKET_TYPE_PAIR, serde_json::json!({ "pair": self.pair }))
    }

    /// Parse the body of a `kdeconnect.pair` packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        packet.expect_type(PACKET_TYPE_PAIR)?;
        packet.body_as()
    }
}

/// Pairing state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingState {
    #[default]
    Unpaired,
    Paired,
}

/// What [`PairingHandler::handle`] did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The connection is now paired
    Accepted,
    /// The peer declined
    Rejected,
    /// Nothing to do: not a pair packet, or already paired
    Ignored,
}

/// Tracks pairing on a single connection
#[derive(Debug, Default)]
pub struct PairingHandler {
    state: PairingState,

    /// We sent a request and are waiting for the answer
    requested: bool,
}

impl PairingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn is_paired(&self) -> bool {
        self.state == PairingState::Paired
    }

    /// Whether a request of ours is awaiting an answer
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Build a pairing request and remember it is outstanding
    ///
    /// The caller sends the returned packet. The peer's `pair: true` answer
    /// then completes pairing without a reply from us.
    pub fn request_pairing(&mut self) -> Packet {
        self.requested = true;
        info!("Requesting pairing");
        PairPacket::request()
    }

    /// Process one received packet
    ///
    /// Packets other than `kdeconnect.pair` are ignored. A request from an
    /// unpaired peer is accepted and answered exactly once; if sending the
    /// answer fails the error is returned and the state is unchanged.
    pub async fn handle<S>(&mut self, sender: &S, packet: &Packet) -> Result<PairingOutcome>
    where
        S: PacketSender + ?Sized,
    {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Ok(PairingOutcome::Ignored);
        }

        let pair = PairPacket::from_packet(packet)?;
        debug!("Pair packet: pair={}, state={:?}", pair.pair, self.state);

        if !pair.pair {
            self.requested = false;
            info!("Pairing rejected by peer");
            return Ok(PairingOutcome::Rejected);
        }

        match self.state {
            PairingState::Paired => {
                debug!("Already paired, ignoring pair request");
                Ok(PairingOutcome::Ignored)
            }
            PairingState::Unpaired if self.requested => {
                self.requested = false;
                self.state = PairingState::Paired;
                info!("Pairing accepted by peer");
                Ok(PairingOutcome::Accepted)
            }
            PairingState::Unpaired => {
                sender.send_packet(&PairPacket::request()).await?;
                self.state = PairingState::Paired;
                info!("Accepted pairing request from peer");
                Ok(PairingOutcome::Accepted)
            }
        }
    }
}
