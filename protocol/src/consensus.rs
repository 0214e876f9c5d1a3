//! # Oral-Messaging Consensus Engine
//!
//! The recursive OM(m) Byzantine agreement engine. A root instance at
//! level m asks every participant for a value; each report arriving at a
//! level above zero spawns a sub-consensus at level m−1 among the
//! remaining peers, verifying what the reporter claimed. Decided children
//! bubble their result into the parent as the value attributed to their
//! reporter; a decided root commits into the word array.
//!
//! ```text
//! root OM(1)        peers = {A,B,C,D}
//!   ├── child(reporter=B)  OM(0)  peers = {A,C,D}
//!   ├── child(reporter=C)  OM(0)  peers = {A,B,D}
//!   └── child(reporter=D)  OM(0)  peers = {A,B,C}
//! ```
//!
//! ## State model
//!
//! Instances live in a flat map keyed by opaque id; parent/child linkage
//! is by id, so there are no ownership cycles to manage. The same id
//! names the same logical instance on every peer, which is what lets
//! reports from different nodes accumulate into one accounting.
//!
//! ## Decision rule
//!
//! Plurality over the reported values, ties broken by the smallest value
//! under string ordering. Deterministic, so every honest node that sees
//! the same reports reaches the same decision. A decision is sticky: once
//! an instance resolves, later reports cannot change it.
//!
//! ## Hardening
//!
//! UDP loses datagrams and peers go silent, so an instance that never
//! completes would otherwise sit in the store forever and the word slot
//! would never move. Two mitigations run from the node's cleanup tick:
//! stalled instances are forcibly decided from whatever reports arrived
//! (falling back to the carried `default_value`), and resolved instances
//! are garbage-collected after a retention window, with a hard cap on the
//! store size.
//!
//! The engine performs no I/O. It returns [`ConsensusAction`] values and
//! the node runtime executes them.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::fault::FaultInjector;
use crate::wire::ConsensusBody;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the consensus store.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How long an instance may sit incomplete before it is forcibly
    /// decided from whatever reports have arrived.
    pub instance_timeout: Duration,
    /// How long a resolved instance is retained before collection. Late
    /// reports bubbling into it within this window still see the sticky
    /// decision.
    pub resolved_retention: Duration,
    /// Upper bound on stored instances. When full of live instances,
    /// datagrams naming new ids are dropped.
    pub max_instances: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            instance_timeout: config::INSTANCE_TIMEOUT,
            resolved_retention: config::INSTANCE_RETENTION,
            max_instances: config::MAX_INSTANCES,
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One node-local view of a single OM instance.
#[derive(Debug, Clone)]
pub struct ConsensusInstance {
    /// Opaque id, unique for the process lifetime.
    pub id: String,
    /// Remaining recursion depth. Zero collects votes only.
    pub omlevel: u32,
    /// Root initiator's peer key, identical across the whole tree.
    pub initiator: String,
    /// Participant set for this instance. Completeness is judged against
    /// exactly this list.
    pub peers: Vec<String>,
    /// Word-array slot under agreement.
    pub index: i64,
    /// The value this node carries into the instance.
    pub value: String,
    /// Parent instance id; `None` at the root.
    pub parentid: Option<String>,
    /// The peer whose parent-level report spawned this instance; `None`
    /// at the root.
    pub reporter: Option<String>,
    /// The initiator's honest value, kept as the fallback for instances
    /// that time out with no reports at all.
    pub default_value: Option<String>,
    /// Participant key → the value that participant contributed here.
    /// Monotonic: keys are never removed, duplicates overwrite.
    pub reports: HashMap<String, String>,
    /// The decision, set exactly once.
    pub resolved: Option<String>,
    /// Reporters for which a child already exists, so retransmits cannot
    /// spawn duplicate subtrees.
    pub subconsensus_launched: HashSet<String>,
    created_at: Instant,
    resolved_at: Option<Instant>,
}

impl ConsensusInstance {
    /// Seeds an instance from an inbound (or locally built) payload.
    fn from_body(body: &ConsensusBody) -> Self {
        Self {
            id: body.id.clone(),
            omlevel: body.omlevel,
            initiator: body.initiator.clone(),
            peers: body.peers.clone(),
            index: body.index,
            value: body.value.clone(),
            parentid: body.parentid.clone(),
            reporter: body.reporter.clone(),
            default_value: body.default_value.clone(),
            reports: HashMap::new(),
            resolved: None,
            subconsensus_launched: HashSet::new(),
            created_at: Instant::now(),
            resolved_at: None,
        }
    }

    /// Records one participant's claimed value. Duplicates overwrite.
    pub fn record_report(&mut self, reporter: &str, value: &str) {
        self.reports.insert(reporter.to_string(), value.to_string());
    }

    /// True once every participant has a recorded report.
    pub fn is_complete(&self) -> bool {
        self.peers.iter().all(|p| self.reports.contains_key(p))
    }

    /// Decides this instance from its reports. Returns the stored decision
    /// unchanged once one exists; `None` when there are no reports.
    pub fn decide(&mut self) -> Option<String> {
        if let Some(resolved) = &self.resolved {
            return Some(resolved.clone());
        }
        let winner = decide_reports(&self.reports)?;
        self.resolved = Some(winner.clone());
        self.resolved_at = Some(Instant::now());
        Some(winner)
    }
}

/// The decision function on its own: plurality with the tie broken by the
/// smallest value under string ordering. Pure, so replaying the same
/// reports always yields the same answer.
pub fn decide_reports(reports: &HashMap<String, String>) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in reports.values() {
        *counts.entry(value.as_str()).or_insert(0) += 1;
    }
    let best = counts.values().copied().max()?;
    counts
        .iter()
        .filter(|(_, count)| **count == best)
        .map(|(value, _)| *value)
        .min()
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Errors & Actions
// ---------------------------------------------------------------------------

/// Errors surfaced to the operator when initiating agreement.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// The participant set came up empty, so there is nobody to agree with.
    #[error("no peers available for consensus")]
    NoPeers,
}

/// Work the engine hands back to the runtime. The engine never touches a
/// socket or the word array itself.
#[derive(Debug, Clone)]
pub enum ConsensusAction {
    /// Transmit a CONSENSUS datagram to the peer with this membership key.
    Send {
        /// Destination peer key (`"host:port"`).
        peer: String,
        /// Payload to deliver.
        body: ConsensusBody,
    },
    /// Write a decided root value into the word array.
    Commit {
        /// Slot to write, already validated to be in range.
        index: usize,
        /// The decided value.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The OM engine: the instance store plus every state transition.
pub struct OmEngine {
    self_key: String,
    config: ConsensusConfig,
    instances: HashMap<String, ConsensusInstance>,
}

impl OmEngine {
    /// Creates an engine for the node with the given membership key.
    pub fn new(self_key: String, config: ConsensusConfig) -> Self {
        Self {
            self_key,
            config,
            instances: HashMap::new(),
        }
    }

    /// Looks up one instance by id.
    pub fn instance(&self, id: &str) -> Option<&ConsensusInstance> {
        self.instances.get(id)
    }

    /// Number of instances currently stored.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Initiates a root agreement on `index` with the honest `value`.
    ///
    /// The participant set is this node plus every known peer. Each
    /// recipient's datagram rolls the fault dice independently, so a lying
    /// initiator may present contradictory views. The initiator's own
    /// chosen value is recorded as its report, which also means a
    /// single-participant root decides on the spot.
    pub fn start_root(
        &mut self,
        index: i64,
        value: &str,
        known_peers: Vec<String>,
        fault: &FaultInjector,
    ) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut participants = Vec::with_capacity(known_peers.len() + 1);
        participants.push(self.self_key.clone());
        for peer in known_peers {
            if !participants.contains(&peer) {
                participants.push(peer);
            }
        }
        if participants.is_empty() {
            return Err(ConsensusError::NoPeers);
        }
        let n = participants.len();
        let m = ((n - 1) / 3) as u32;
        let id = Uuid::new_v4().to_string();
        let self_value = fault.choose(value);
        let body = ConsensusBody {
            id: id.clone(),
            omlevel: m,
            initiator: self.self_key.clone(),
            peers: participants.clone(),
            index,
            value: self_value.clone(),
            parentid: None,
            reporter: None,
            default_value: Some(value.to_string()),
        };
        self.instances
            .insert(id.clone(), ConsensusInstance::from_body(&body));

        let mut actions = Vec::new();
        // The initiator's own view commits eagerly; the decided root value
        // overwrites it later if the fleet disagrees. The lone-participant
        // case commits through the decision path just below instead.
        if m > 0 && in_slot_range(index) {
            actions.push(ConsensusAction::Commit {
                index: index as usize,
                value: self_value.clone(),
            });
        }
        for peer in &participants {
            if *peer == self.self_key {
                continue;
            }
            let mut per_edge = body.clone();
            per_edge.value = fault.choose(value);
            actions.push(ConsensusAction::Send {
                peer: peer.clone(),
                body: per_edge,
            });
        }
        info!(id = %id, index, m, value = %self_value, participants = n, "root consensus started");
        let self_key = self.self_key.clone();
        self.propagate_up(&id, &self_key, &self_value, &mut actions);
        Ok(actions)
    }

    /// Handles one inbound CONSENSUS datagram from the peer keyed
    /// `src_key`. Membership upkeep for the source is the runtime's job.
    pub fn handle_incoming(
        &mut self,
        body: &ConsensusBody,
        src_key: &str,
        fault: &FaultInjector,
    ) -> Vec<ConsensusAction> {
        let mut actions = Vec::new();
        if !self.admit(body) {
            return actions;
        }
        let Some(instance) = self.instances.get_mut(&body.id) else {
            return actions;
        };
        instance.record_report(src_key, &body.value);
        let omlevel = instance.omlevel;
        if omlevel > 0 {
            self.spawn_child(&body.id, src_key, &body.value, fault, &mut actions);
        } else {
            self.propagate_up(&body.id, src_key, &body.value, &mut actions);
        }
        actions
    }

    /// Periodic maintenance, driven by the runtime's cleanup tick:
    /// force-decides stalled instances, collects resolved ones past
    /// retention, and enforces the store cap.
    pub fn sweep(&mut self, now: Instant) -> Vec<ConsensusAction> {
        let mut actions = Vec::new();

        let stalled: Vec<String> = self
            .instances
            .values()
            .filter(|i| {
                i.resolved.is_none()
                    && now.duration_since(i.created_at) >= self.config.instance_timeout
            })
            .map(|i| i.id.clone())
            .collect();
        for id in stalled {
            self.force_resolve(&id, &mut actions);
        }

        let retention = self.config.resolved_retention;
        self.instances.retain(|_, i| match i.resolved_at {
            Some(at) => now.duration_since(at) < retention,
            None => true,
        });

        while self.instances.len() > self.config.max_instances {
            if !self.evict_one_resolved() {
                break;
            }
        }
        actions
    }

    /// Spawns the sub-consensus verifying what `reporter` claimed at
    /// `parent_id`. Idempotent against retransmits: each parent launches
    /// at most one child per reporter.
    fn spawn_child(
        &mut self,
        parent_id: &str,
        reporter: &str,
        received: &str,
        fault: &FaultInjector,
        actions: &mut Vec<ConsensusAction>,
    ) {
        let Some(parent) = self.instances.get_mut(parent_id) else {
            warn!(parent = parent_id, "sub-consensus requested for unknown parent");
            return;
        };
        if parent.omlevel == 0 || parent.subconsensus_launched.contains(reporter) {
            return;
        }
        // The reporter's own claim is not re-relayed by its own branch.
        let child_peers: Vec<String> = parent
            .peers
            .iter()
            .filter(|p| p.as_str() != reporter)
            .cloned()
            .collect();
        if child_peers.is_empty() {
            return;
        }
        parent.subconsensus_launched.insert(reporter.to_string());
        let omlevel = parent.omlevel - 1;
        let initiator = parent.initiator.clone();
        let index = parent.index;
        let default_value = parent.default_value.clone();
        let parent_id = parent_id.to_string();

        let self_value = fault.choose(received);
        let body = ConsensusBody {
            id: Uuid::new_v4().to_string(),
            omlevel,
            initiator,
            peers: child_peers.clone(),
            index,
            value: self_value.clone(),
            parentid: Some(parent_id.clone()),
            reporter: Some(reporter.to_string()),
            default_value,
        };
        debug!(
            parent = %parent_id,
            child = %body.id,
            reporter,
            level = omlevel,
            "launching sub-consensus"
        );
        self.instances
            .insert(body.id.clone(), ConsensusInstance::from_body(&body));
        for peer in &child_peers {
            let mut per_edge = body.clone();
            per_edge.value = fault.choose(received);
            actions.push(ConsensusAction::Send {
                peer: peer.clone(),
                body: per_edge,
            });
        }
        // What we relayed becomes our own report at the parent level.
        let self_key = self.self_key.clone();
        self.propagate_up(&parent_id, &self_key, &self_value, actions);
    }

    /// Records a report and, when that completes the instance, decides it
    /// and carries the result upward.
    fn propagate_up(
        &mut self,
        id: &str,
        reporter: &str,
        value: &str,
        actions: &mut Vec<ConsensusAction>,
    ) {
        let Some(instance) = self.instances.get_mut(id) else {
            // A parent collected before its child, or a hostile payload
            // naming an id we never stored. Either way: log and carry on.
            warn!(id, "report for unknown consensus instance ignored");
            return;
        };
        instance.record_report(reporter, value);
        if !instance.is_complete() {
            return;
        }
        let Some(result) = instance.decide() else {
            return;
        };
        self.bubble(id, reporter, result, actions);
    }

    /// Carries a decided instance's result one level up, or commits it at
    /// the root.
    fn bubble(&mut self, id: &str, reporter: &str, result: String, actions: &mut Vec<ConsensusAction>) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let index = instance.index;
        let parentid = instance.parentid.clone();
        // The value decided here is attributed, at the parent, to the peer
        // whose claim this instance was verifying.
        let parent_reporter = instance.reporter.clone().unwrap_or_else(|| {
            if reporter.is_empty() {
                instance.initiator.clone()
            } else {
                reporter.to_string()
            }
        });
        match parentid {
            Some(parent) => {
                debug!(id, parent = %parent, value = %result, "sub-consensus decided, bubbling up");
                self.propagate_up(&parent, &parent_reporter, &result, actions);
            }
            None => {
                if in_slot_range(index) {
                    info!(id, index, value = %result, "consensus complete");
                    actions.push(ConsensusAction::Commit {
                        index: index as usize,
                        value: result,
                    });
                } else {
                    warn!(id, index, "consensus decided for an out-of-range slot, nothing committed");
                }
            }
        }
    }

    /// Forcibly decides a stalled instance from the reports it has,
    /// falling back to the carried default when it has none.
    fn force_resolve(&mut self, id: &str, actions: &mut Vec<ConsensusAction>) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.resolved.is_some() {
            return;
        }
        let result = match instance.decide().or_else(|| instance.default_value.clone()) {
            Some(result) => result,
            None => {
                debug!(id, "stalled instance has neither reports nor a default value");
                return;
            }
        };
        if instance.resolved.is_none() {
            instance.resolved = Some(result.clone());
            instance.resolved_at = Some(Instant::now());
        }
        let have = instance.reports.len();
        let expected = instance.peers.len();
        warn!(id, value = %result, have, expected, "instance timed out, deciding from what arrived");
        self.bubble(id, "", result, actions);
    }

    /// Ensures the instance named by the payload exists, creating it if
    /// the store has room. Returns false when the datagram must be dropped.
    fn admit(&mut self, body: &ConsensusBody) -> bool {
        if self.instances.contains_key(&body.id) {
            return true;
        }
        if self.instances.len() >= self.config.max_instances && !self.evict_one_resolved() {
            warn!(id = %body.id, "instance store is full of live instances, dropping datagram");
            return false;
        }
        self.instances
            .insert(body.id.clone(), ConsensusInstance::from_body(body));
        true
    }

    /// Evicts the longest-resolved instance. Returns false when nothing
    /// resolved is left to evict.
    fn evict_one_resolved(&mut self) -> bool {
        let oldest = self
            .instances
            .values()
            .filter_map(|i| i.resolved_at.map(|at| (at, i.id.clone())))
            .min_by_key(|(at, _)| *at);
        match oldest {
            Some((_, id)) => {
                debug!(id = %id, "evicting resolved instance to stay under the cap");
                self.instances.remove(&id);
                true
            }
            None => false,
        }
    }
}

fn in_slot_range(index: i64) -> bool {
    (0..config::WORD_SLOTS as i64).contains(&index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultStyle;

    const SELF: &str = "10.0.0.1:10000";
    const PEER_A: &str = "10.0.0.2:10000";
    const PEER_B: &str = "10.0.0.3:10000";
    const PEER_C: &str = "10.0.0.4:10000";

    fn truthful() -> FaultInjector {
        FaultInjector::new(FaultStyle::Sentinel)
    }

    fn engine() -> OmEngine {
        OmEngine::new(SELF.to_string(), ConsensusConfig::default())
    }

    fn root_body(id: &str, omlevel: u32, peers: &[&str], value: &str) -> ConsensusBody {
        ConsensusBody {
            id: id.into(),
            omlevel,
            initiator: PEER_A.into(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            index: 2,
            value: value.into(),
            parentid: None,
            reporter: None,
            default_value: Some(value.into()),
        }
    }

    fn commits(actions: &[ConsensusAction]) -> Vec<(usize, String)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConsensusAction::Commit { index, value } => Some((*index, value.clone())),
                _ => None,
            })
            .collect()
    }

    fn sends(actions: &[ConsensusAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConsensusAction::Send { peer, .. } => Some(peer.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lone_root_decides_immediately() {
        let mut engine = engine();
        let actions = engine
            .start_root(0, "hello", vec![], &truthful())
            .expect("starts");
        assert_eq!(commits(&actions), vec![(0, "hello".to_string())]);
        assert!(sends(&actions).is_empty());

        let (id, instance) = engine.instances.iter().next().expect("one instance");
        assert_eq!(instance.omlevel, 0);
        assert_eq!(instance.resolved.as_deref(), Some("hello"));
        assert_eq!(engine.instance(id).unwrap().peers, vec![SELF.to_string()]);
    }

    #[test]
    fn root_of_four_gets_one_fault_level_and_an_eager_commit() {
        let mut engine = engine();
        let known = vec![PEER_A.to_string(), PEER_B.to_string(), PEER_C.to_string()];
        let actions = engine
            .start_root(1, "alpha", known, &truthful())
            .expect("starts");

        let mut dests = sends(&actions);
        dests.sort_unstable();
        assert_eq!(dests, vec![PEER_A, PEER_B, PEER_C]);
        // n = 4 means m = 1, so the initiator commits its own view up front.
        assert_eq!(commits(&actions), vec![(1, "alpha".to_string())]);

        let instance = engine.instances.values().next().unwrap();
        assert_eq!(instance.omlevel, 1);
        assert_eq!(instance.peers[0], SELF, "root peers lead with the local key");
        assert_eq!(instance.default_value.as_deref(), Some("alpha"));
        assert_eq!(instance.reports.get(SELF).map(String::as_str), Some("alpha"));
        assert!(instance.resolved.is_none());
    }

    #[test]
    fn known_peers_are_deduplicated_against_self() {
        let mut engine = engine();
        let known = vec![SELF.to_string(), PEER_A.to_string(), PEER_A.to_string()];
        engine.start_root(0, "w", known, &truthful()).expect("starts");
        let instance = engine.instances.values().next().unwrap();
        assert_eq!(instance.peers, vec![SELF.to_string(), PEER_A.to_string()]);
    }

    #[test]
    fn report_at_level_above_zero_spawns_exactly_one_child_per_reporter() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-1", 1, &[PEER_A, PEER_B, PEER_C, SELF], "alpha");

        let actions = engine.handle_incoming(&body, PEER_A, &truthful());
        assert_eq!(engine.instance_count(), 2);
        // The child broadcast goes to every child participant, ourselves
        // included; the loopback delivery records our report in the child.
        let mut dests = sends(&actions);
        dests.sort_unstable();
        assert_eq!(dests, vec![SELF, PEER_B, PEER_C]);

        let parent = engine.instance("root-1").unwrap();
        assert!(parent.subconsensus_launched.contains(PEER_A));
        assert_eq!(parent.reports.len(), 2, "sender plus our own relay");

        // Retransmit: no second child, no new traffic, same accounting.
        let retry = engine.handle_incoming(&body, PEER_A, &truthful());
        assert!(retry.is_empty());
        assert_eq!(engine.instance_count(), 2);
        assert_eq!(engine.instance("root-1").unwrap().reports.len(), 2);
    }

    #[test]
    fn child_excludes_its_reporter_and_links_to_the_parent() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-2", 2, &[PEER_A, PEER_B, PEER_C], "alpha");
        engine.handle_incoming(&body, PEER_A, &truthful());

        let child = engine
            .instances
            .values()
            .find(|i| i.parentid.is_some())
            .expect("child spawned");
        assert_eq!(child.parentid.as_deref(), Some("root-2"));
        assert_eq!(child.reporter.as_deref(), Some(PEER_A));
        assert_eq!(child.omlevel, 1);
        assert_eq!(child.initiator, PEER_A);
        assert_eq!(child.peers, vec![PEER_B.to_string(), PEER_C.to_string()]);
        assert_eq!(child.default_value.as_deref(), Some("alpha"));
    }

    #[test]
    fn two_party_level_one_completes_at_the_root() {
        // Parent peers {A, us}: our relay report completes the root the
        // moment A's report spawns the child.
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-3", 1, &[PEER_A, PEER_B], "x");
        let actions = engine.handle_incoming(&body, PEER_A, &truthful());
        assert_eq!(commits(&actions), vec![(2, "x".to_string())]);
        assert_eq!(
            engine.instance("root-3").unwrap().resolved.as_deref(),
            Some("x")
        );
    }

    #[test]
    fn leaf_report_alone_does_not_complete_and_times_out_later() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-4", 0, &[PEER_A, PEER_B], "x");
        let actions = engine.handle_incoming(&body, PEER_A, &truthful());
        assert!(commits(&actions).is_empty());
        assert!(engine.instance("root-4").unwrap().resolved.is_none());

        // Nobody else ever reports; the sweep decides from what arrived.
        let later = Instant::now() + config::INSTANCE_TIMEOUT + Duration::from_secs(1);
        let actions = engine.sweep(later);
        assert_eq!(commits(&actions), vec![(2, "x".to_string())]);
        assert_eq!(
            engine.instance("root-4").unwrap().resolved.as_deref(),
            Some("x")
        );
    }

    #[test]
    fn forced_child_decision_bubbles_into_the_parent() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-5", 1, &[PEER_A, PEER_B, PEER_C], "alpha");
        engine.handle_incoming(&body, PEER_A, &truthful());

        // Parent waits on C, child waits on everyone. One sweep past the
        // timeout settles the whole tree from partial data.
        let later = Instant::now() + config::INSTANCE_TIMEOUT + Duration::from_secs(1);
        let actions = engine.sweep(later);
        assert_eq!(commits(&actions), vec![(2, "alpha".to_string())]);

        let parent = engine.instance("root-5").unwrap();
        assert_eq!(parent.resolved.as_deref(), Some("alpha"));
        // The child's decision landed under its reporter's key.
        assert_eq!(parent.reports.get(PEER_A).map(String::as_str), Some("alpha"));
    }

    #[test]
    fn decision_is_pure_plurality_with_lex_tie_break() {
        let mut reports = HashMap::new();
        reports.insert("a".to_string(), "foo".to_string());
        reports.insert("b".to_string(), "bar".to_string());
        reports.insert("c".to_string(), "foo".to_string());
        assert_eq!(decide_reports(&reports).as_deref(), Some("foo"));
        // Replaying the identical map yields the identical answer.
        assert_eq!(decide_reports(&reports).as_deref(), Some("foo"));

        let mut tied = HashMap::new();
        tied.insert("a".to_string(), "zebra".to_string());
        tied.insert("b".to_string(), "apple".to_string());
        assert_eq!(decide_reports(&tied).as_deref(), Some("apple"));

        assert_eq!(decide_reports(&HashMap::new()), None);
    }

    #[test]
    fn resolved_value_is_sticky() {
        let mut instance = ConsensusInstance::from_body(&root_body("i", 0, &[PEER_A], "x"));
        instance.record_report(PEER_A, "x");
        assert_eq!(instance.decide().as_deref(), Some("x"));

        // A late conflicting report cannot rewrite history.
        instance.record_report(PEER_A, "y");
        assert_eq!(instance.decide().as_deref(), Some("x"));
        assert!(instance.resolved.as_deref() == Some("x"));
    }

    #[test]
    fn decided_value_is_always_one_of_the_reports() {
        let mut reports = HashMap::new();
        for (peer, value) in [("a", "x"), ("b", "y"), ("c", "y"), ("d", "z")] {
            reports.insert(peer.to_string(), value.to_string());
        }
        let decided = decide_reports(&reports).unwrap();
        assert!(reports.values().any(|v| *v == decided));
    }

    #[test]
    fn out_of_range_index_decides_but_never_commits() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let mut body = root_body("root-6", 0, &[PEER_A], "w");
        body.index = 9;
        let actions = engine.handle_incoming(&body, PEER_A, &truthful());
        assert!(commits(&actions).is_empty());
        assert_eq!(
            engine.instance("root-6").unwrap().resolved.as_deref(),
            Some("w")
        );
    }

    #[test]
    fn timeout_with_no_reports_falls_back_to_the_default_value() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-7", 0, &[PEER_A, PEER_B], "fallback");
        engine.handle_incoming(&body, PEER_A, &truthful());
        // Simulate an instance that never heard anything at all.
        engine
            .instances
            .get_mut("root-7")
            .unwrap()
            .reports
            .clear();

        let later = Instant::now() + config::INSTANCE_TIMEOUT + Duration::from_secs(1);
        let actions = engine.sweep(later);
        assert_eq!(commits(&actions), vec![(2, "fallback".to_string())]);
    }

    #[test]
    fn resolved_instances_are_collected_after_retention() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-8", 0, &[PEER_A], "w");
        engine.handle_incoming(&body, PEER_A, &truthful());
        assert!(engine.instance("root-8").unwrap().resolved.is_some());

        let later = Instant::now() + config::INSTANCE_RETENTION + Duration::from_secs(1);
        engine.sweep(later);
        assert!(engine.instance("root-8").is_none());
    }

    #[test]
    fn full_store_of_live_instances_drops_new_ids() {
        let config = ConsensusConfig {
            max_instances: 2,
            ..ConsensusConfig::default()
        };
        let mut engine = OmEngine::new(PEER_B.to_string(), config);
        for id in ["live-1", "live-2", "live-3"] {
            // Two participants, one report: stays unresolved.
            let body = root_body(id, 0, &[PEER_A, PEER_B], "w");
            engine.handle_incoming(&body, PEER_A, &truthful());
        }
        assert_eq!(engine.instance_count(), 2);
        assert!(engine.instance("live-3").is_none());
    }

    #[test]
    fn report_bounds_respect_the_participant_set() {
        let mut engine = OmEngine::new(PEER_B.to_string(), ConsensusConfig::default());
        let body = root_body("root-9", 1, &[PEER_A, PEER_B, PEER_C], "alpha");
        engine.handle_incoming(&body, PEER_A, &truthful());
        let parent = engine.instance("root-9").unwrap();
        assert!(parent.reports.len() <= parent.peers.len());
        assert!(parent.subconsensus_launched.len() <= parent.peers.len());
    }
}
