//! # Gossip Engine
//!
//! Epidemic peer discovery. A node announces itself with a fresh-id
//! `GOSSIP` datagram; receivers learn the announcer, forward the message
//! to a random handful of their own peers, and greet first contacts with
//! a direct `GOSSIP_REPLY`. A periodic heartbeat repeats the announcement
//! so quiet nodes are not mistaken for dead ones.
//!
//! ## Deduplication
//!
//! Every announcement carries an opaque id. Ids live in a seen-cache for
//! [`config::GOSSIP_SEEN_TTL`]; within that window a given id is forwarded
//! at most once per node, which is what keeps the epidemic from becoming a
//! broadcast storm. A node marks its own ids as seen at creation so its
//! announcements are never re-forwarded when they echo back.
//!
//! The engine performs no I/O. It returns [`GossipSend`] values and the
//! node runtime puts them on the wire, swallowing per-destination send
//! failures.

use std::time::Instant;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::trace;
use uuid::Uuid;

use crate::config;
use crate::membership::{peer_key, PeerTable};
use crate::wire::{GossipBody, WireMessage};

// ---------------------------------------------------------------------------
// Local Identity
// ---------------------------------------------------------------------------

/// What a node advertises about itself in every announcement.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// IPv4 address other peers should use to reach this node.
    pub host: String,
    /// UDP port this node listens on.
    pub port: u16,
    /// Operator-chosen display label.
    pub name: String,
    /// TCP port of the operator console, advertised for humans.
    pub cli_port: u16,
}

impl LocalIdentity {
    /// This node's canonical membership key.
    pub fn key(&self) -> String {
        peer_key(&self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Outbound Work
// ---------------------------------------------------------------------------

/// A datagram the runtime must transmit. The engine never touches the
/// socket itself.
#[derive(Debug, Clone)]
pub struct GossipSend {
    /// Destination host (IPv4 literal or a hostname for the seeds).
    pub host: String,
    /// Destination UDP port.
    pub port: u16,
    /// The message to put on the wire.
    pub message: WireMessage,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Duplicate suppression plus the forwarding and reply rules.
pub struct GossipEngine {
    local: LocalIdentity,
    seen: DashMap<String, Instant>,
}

impl GossipEngine {
    /// Creates an engine announcing the given identity.
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            seen: DashMap::new(),
        }
    }

    /// The identity this engine announces.
    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// Startup announcement: one fresh-id `GOSSIP` to every target,
    /// normally the well-known seeds.
    pub fn announce(&self, targets: &[(String, u16)], now: Instant) -> Vec<GossipSend> {
        let message = self.fresh_announcement(now);
        targets
            .iter()
            .map(|(host, port)| GossipSend {
                host: host.clone(),
                port: *port,
                message: message.clone(),
            })
            .collect()
    }

    /// Periodic heartbeat: one fresh-id `GOSSIP` to a random sample of up
    /// to [`config::GOSSIP_FANOUT`] known peers.
    pub fn heartbeat(&self, peers: &PeerTable, now: Instant) -> Vec<GossipSend> {
        let message = self.fresh_announcement(now);
        let mut candidates: Vec<(String, u16)> =
            peers.list().map(|p| (p.host.clone(), p.port)).collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .take(config::GOSSIP_FANOUT)
            .map(|(host, port)| GossipSend {
                host,
                port,
                message: message.clone(),
            })
            .collect()
    }

    /// Handles an inbound `GOSSIP`.
    ///
    /// The payload's host/port are authoritative for membership (the
    /// datagram source may be a forwarder). Novel ids are forwarded
    /// verbatim to a random sample of peers excluding the source; a sender
    /// we had never heard of gets a `GOSSIP_REPLY` straight back to the
    /// transport source so the greeting survives NAT.
    pub fn handle_gossip(
        &self,
        body: &GossipBody,
        src: (&str, u16),
        peers: &mut PeerTable,
        now: Instant,
    ) -> Vec<GossipSend> {
        let seen = self.mark_seen(&body.id, now);

        // Our own announcement, echoed back through the fleet. The id is
        // already in the seen-cache; there is nothing else to learn.
        if body.host == self.local.host && body.port == self.local.port {
            return Vec::new();
        }

        let first_contact = !peers.contains_endpoint(&body.host, body.port);
        peers.add(&body.host, body.port, Some(&body.name));

        let mut sends = Vec::new();
        if seen {
            trace!(id = %body.id, "suppressing duplicate gossip");
        } else {
            let src_key = peer_key(src.0, src.1);
            let self_key = self.local.key();
            let mut candidates: Vec<(String, u16)> = peers
                .list()
                .filter(|p| p.key != src_key && p.key != self_key)
                .map(|p| (p.host.clone(), p.port))
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            for (host, port) in candidates.into_iter().take(config::GOSSIP_FANOUT) {
                sends.push(GossipSend {
                    host,
                    port,
                    message: WireMessage::Gossip(body.clone()),
                });
            }
        }

        if first_contact {
            sends.push(GossipSend {
                host: src.0.to_string(),
                port: src.1,
                message: WireMessage::GossipReply(self.body_with_fresh_id()),
            });
        }

        sends
    }

    /// Handles an inbound `GOSSIP_REPLY`: the payload tells us who is
    /// greeting us.
    pub fn handle_reply(&self, body: &GossipBody, peers: &mut PeerTable) {
        if body.host == self.local.host && body.port == self.local.port {
            return;
        }
        peers.add(&body.host, body.port, Some(&body.name));
    }

    /// Number of ids currently held for duplicate suppression.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Builds a fresh announcement and marks its id as seen so our own
    /// message is never re-forwarded when it comes back around.
    fn fresh_announcement(&self, now: Instant) -> WireMessage {
        let body = self.body_with_fresh_id();
        self.seen.insert(body.id.clone(), now);
        WireMessage::Gossip(body)
    }

    fn body_with_fresh_id(&self) -> GossipBody {
        GossipBody {
            host: self.local.host.clone(),
            port: self.local.port,
            name: self.local.name.clone(),
            id: Uuid::new_v4().to_string(),
            cli_port: self.local.cli_port,
        }
    }

    /// Marks an id as seen, purging expired entries first. Returns whether
    /// the id was already present within the TTL window.
    fn mark_seen(&self, id: &str, now: Instant) -> bool {
        self.seen
            .retain(|_, inserted| now.duration_since(*inserted) < config::GOSSIP_SEEN_TTL);
        if self.seen.contains_key(id) {
            return true;
        }
        self.seen.insert(id.to_string(), now);
        false
    }
}
