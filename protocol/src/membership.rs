//! # Peer Membership
//!
//! Tracks every peer this node has heard from, keyed by the canonical
//! `"host:port"` string. Hostnames are resolved to IPv4 before keying so
//! that a DNS alias and its address collapse into a single record.
//!
//! Records refresh on every inbound message from their endpoint and are
//! evicted once they stay silent longer than [`config::PEER_STALE_AFTER`].
//! Eviction runs from the node's cleanup tick, never inline with message
//! handling.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::config;

/// Builds the canonical membership key for an endpoint.
pub fn peer_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Splits a canonical key back into host and port. Returns `None` for
/// strings that do not look like `"host:port"`.
pub fn split_key(key: &str) -> Option<(&str, u16)> {
    let (host, port) = key.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host, port))
}

// ---------------------------------------------------------------------------
// Host Resolution
// ---------------------------------------------------------------------------

/// Hostname-to-IPv4 resolution, injected so the runtime can use the system
/// resolver while tests stay hermetic.
///
/// Resolution is synchronous. A slow resolver stalls the event loop; this
/// is a known and accepted weakness of the design.
pub trait HostResolver: Send + Sync {
    /// Resolves `host` to a dotted-quad IPv4 string, returning `host`
    /// unchanged when resolution fails (best effort).
    fn resolve_ipv4(&self, host: &str) -> String;
}

/// [`HostResolver`] backed by the operating system resolver.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve_ipv4(&self, host: &str) -> String {
        // Literal addresses skip the resolver entirely.
        if host.parse::<std::net::Ipv4Addr>().is_ok() {
            return host.to_string();
        }
        match (host, 0u16).to_socket_addrs() {
            Ok(addrs) => addrs
                .filter_map(|addr| match addr {
                    SocketAddr::V4(v4) => Some(v4.ip().to_string()),
                    SocketAddr::V6(_) => None,
                })
                .next()
                .unwrap_or_else(|| host.to_string()),
            Err(_) => host.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Peer Records
// ---------------------------------------------------------------------------

/// A single known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Canonical `"host:port"` key.
    pub key: String,
    /// Resolved IPv4 host.
    pub host: String,
    /// UDP port the peer listens on.
    pub port: u16,
    /// Peer-chosen display label. Defaults to the key until the peer
    /// announces a name.
    pub name: String,
    /// Monotonic timestamp of the last message from this endpoint.
    pub last_seen: Instant,
}

/// The set of peers this node currently believes to be alive.
///
/// No ordering is guaranteed over [`PeerTable::list`]. The table never
/// contains the local node; the runtime filters its own key before
/// inserting.
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
    resolver: Arc<dyn HostResolver>,
}

impl PeerTable {
    /// Creates an empty table using the given resolver for keying.
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            peers: HashMap::new(),
            resolver,
        }
    }

    /// Upserts a peer sighting and returns its canonical key.
    ///
    /// First sighting creates the record; later sightings refresh
    /// `last_seen` and adopt a newly announced non-empty name.
    pub fn add(&mut self, host: &str, port: u16, name: Option<&str>) -> String {
        let resolved = self.resolver.resolve_ipv4(host);
        let key = peer_key(&resolved, port);
        let name = name.filter(|n| !n.is_empty());
        match self.peers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.last_seen = Instant::now();
                if let Some(name) = name {
                    record.name = name.to_string();
                }
            }
            Entry::Vacant(entry) => {
                info!(peer = %key, "added peer");
                entry.insert(PeerRecord {
                    key: key.clone(),
                    host: resolved,
                    port,
                    name: name.map(str::to_string).unwrap_or_else(|| key.clone()),
                    last_seen: Instant::now(),
                });
            }
        }
        key
    }

    /// Refreshes `last_seen` for an already-known peer. Unknown keys are
    /// ignored.
    pub fn touch(&mut self, key: &str) {
        if let Some(record) = self.peers.get_mut(key) {
            record.last_seen = Instant::now();
        }
    }

    /// Whether the given canonical key is currently known.
    pub fn contains(&self, key: &str) -> bool {
        self.peers.contains_key(key)
    }

    /// Whether the given endpoint is currently known, resolving the host
    /// the same way [`PeerTable::add`] would.
    pub fn contains_endpoint(&self, host: &str, port: u16) -> bool {
        let resolved = self.resolver.resolve_ipv4(host);
        self.peers.contains_key(&peer_key(&resolved, port))
    }

    /// Looks up one record by canonical key.
    pub fn get(&self, key: &str) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    /// Iterates over all known peers, in no particular order.
    pub fn list(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// All canonical keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drops every record whose silence exceeds the stale window, judged
    /// against `now`. Returns how many were removed.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.peers.len();
        self.peers.retain(|key, record| {
            let keep = now.duration_since(record.last_seen) <= config::PEER_STALE_AFTER;
            if !keep {
                info!(peer = %key, "removing stale peer");
            }
            keep
        });
        before - self.peers.len()
    }
}
