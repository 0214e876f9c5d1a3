//! # Wire Codec
//!
//! Every datagram on a Chorus network is a single UTF-8 JSON object with a
//! `command` tag. Three variants exist: `GOSSIP` and `GOSSIP_REPLY` carry
//! presence announcements, `CONSENSUS` carries one report within one
//! oral-messaging instance.
//!
//! The codec is deliberately forgiving on the field level (`index` is a
//! signed integer because a Byzantine peer can put anything there) and
//! strict on the envelope: malformed JSON, unknown tags, and missing
//! required fields all fail decoding, and the runtime drops the datagram
//! after logging.

use serde::{Deserialize, Serialize};

use crate::config;

// ---------------------------------------------------------------------------
// Message Bodies
// ---------------------------------------------------------------------------

/// Presence announcement shared by `GOSSIP` and `GOSSIP_REPLY`.
///
/// `host`/`port` are the announcing peer's listening endpoint and are
/// authoritative for membership; the datagram source may be a forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipBody {
    /// IPv4 address the peer listens on.
    pub host: String,
    /// UDP port the peer listens on.
    pub port: u16,
    /// Peer-chosen display label. No protocol meaning.
    pub name: String,
    /// Opaque id for duplicate suppression; fresh per announcement.
    pub id: String,
    /// TCP port of the peer's operator console.
    #[serde(rename = "cliPort")]
    pub cli_port: u16,
}

/// One report within one oral-messaging consensus instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusBody {
    /// Instance id. The same id names the same instance on every peer.
    pub id: String,
    /// Remaining recursion depth. Zero means votes only.
    pub omlevel: u32,
    /// Peer key of the root initiator, propagated unchanged down the tree.
    pub initiator: String,
    /// Participant set for this instance. Ground truth for completeness.
    pub peers: Vec<String>,
    /// Word-array slot under agreement. Signed because remote peers may
    /// send anything; commitment checks the range.
    pub index: i64,
    /// The value the sender contributes at this level.
    pub value: String,
    /// Parent instance id; absent at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parentid: Option<String>,
    /// The peer whose parent-level report caused this instance to exist;
    /// absent at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
    /// The initiator's honest value, carried as a fallback for instances
    /// that time out before any report lands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// The full set of datagram variants, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum WireMessage {
    /// Presence announcement, forwarded epidemically.
    #[serde(rename = "GOSSIP")]
    Gossip(GossipBody),
    /// Direct response to a first-contact announcement.
    #[serde(rename = "GOSSIP_REPLY")]
    GossipReply(GossipBody),
    /// Consensus report.
    #[serde(rename = "CONSENSUS")]
    Consensus(ConsensusBody),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors produced by the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The bytes were not a well-formed message (bad JSON, unknown
    /// command, missing or mistyped fields).
    #[error("malformed datagram: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The encoded message would not survive the receiver's buffer.
    #[error("datagram of {got} bytes exceeds the {max}-byte limit")]
    Oversized {
        /// The hard wire limit.
        max: usize,
        /// The encoded size we refused to send.
        got: usize,
    },
}

/// Encodes a message to its JSON datagram bytes.
///
/// Refuses to produce a payload larger than the wire limit; the receiver
/// would truncate it into garbage anyway.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > config::MAX_DATAGRAM_BYTES {
        return Err(WireError::Oversized {
            max: config::MAX_DATAGRAM_BYTES,
            got: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Decodes one datagram's bytes into a message.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}
