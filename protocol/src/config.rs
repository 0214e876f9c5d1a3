//! # Protocol Configuration & Constants
//!
//! Every magic number in Chorus lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! These values define how a fleet behaves together. A node built with a
//! different heartbeat or stale window will still interoperate, but it will
//! see a skewed view of the membership, so change them fleet-wide or not
//! at all.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Parameters
// ---------------------------------------------------------------------------

/// Maximum datagram payload in bytes. The receive buffer is exactly this
/// large, so anything bigger truncates on arrival and fails to decode.
pub const MAX_DATAGRAM_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Gossip Parameters
// ---------------------------------------------------------------------------

/// Number of peers a novel gossip message is forwarded to. Five gives
/// O(log N) propagation without flooding small fleets.
pub const GOSSIP_FANOUT: usize = 5;

/// How long a gossip id stays in the duplicate-suppression cache. A node
/// forwards a given id at most once within this window.
pub const GOSSIP_SEEN_TTL: Duration = Duration::from_secs(300);

/// Heartbeat period. Each beat sends a fresh announcement to a random
/// sample of known peers, refreshing our presence in their tables.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Membership Parameters
// ---------------------------------------------------------------------------

/// A peer that has been silent this long is presumed gone and evicted.
/// Two missed heartbeats, even if the second one was slightly late.
pub const PEER_STALE_AFTER: Duration = Duration::from_secs(120);

/// How often the runtime runs stale-peer eviction and the consensus sweep.
pub const PEER_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Well-known Seeds
// ---------------------------------------------------------------------------

/// UDP port the seed nodes listen on.
pub const SEED_PORT: u16 = 10000;

/// Bootstrap endpoints contacted once at startup. Hardcoded on purpose:
/// operators who want different seeds rebuild the binary.
pub const WELL_KNOWN_SEEDS: [(&str, u16); 4] = [
    ("seed0.chorus.network", SEED_PORT),
    ("seed1.chorus.network", SEED_PORT),
    ("seed2.chorus.network", SEED_PORT),
    ("seed3.chorus.network", SEED_PORT),
];

// ---------------------------------------------------------------------------
// Word Array
// ---------------------------------------------------------------------------

/// Number of slots in the agreed word array. Fixed by the protocol; a
/// consensus naming a slot outside `0..WORD_SLOTS` still decides, but the
/// result is never committed.
pub const WORD_SLOTS: usize = 5;

// ---------------------------------------------------------------------------
// Consensus Hardening
// ---------------------------------------------------------------------------

/// How long an instance may wait for missing reports before it is forcibly
/// decided from whatever arrived. Sized well above worst-case round-trip
/// times fan-out, because a premature decision is worse than a late one.
pub const INSTANCE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a resolved instance is retained before garbage collection.
/// Long enough for stragglers to bubble their late reports into it.
pub const INSTANCE_RETENTION: Duration = Duration::from_secs(300);

/// Upper bound on stored consensus instances. Caps memory when a hostile
/// peer floods us with novel instance ids.
pub const MAX_INSTANCES: usize = 4096;

// ---------------------------------------------------------------------------
// Fault Injection
// ---------------------------------------------------------------------------

/// The fixed faulty value used in sentinel mode.
pub const FAULT_SENTINEL: &str = "faulty_attack";

/// Decoy values drawn at random per outgoing edge in decoy mode. Distinct
/// recipients get distinct stories, which is the whole point of lying.
pub const FAULT_DECOYS: [&str; 5] = ["gravel", "fog", "static", "brine", "soot"];

// ---------------------------------------------------------------------------
// Identity Defaults
// ---------------------------------------------------------------------------

/// Display name announced when the operator does not pick one. A label
/// only; nothing in the protocol keys off it.
pub const DEFAULT_NODE_NAME: &str = "chorus-peer";
