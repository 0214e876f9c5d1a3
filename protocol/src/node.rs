//! # Peer Node Runtime
//!
//! The single-owner event loop that ties the engines together. One tokio
//! task owns the peer table, gossip cache, consensus store, fault
//! injector, and the word array; everything else talks to it through
//! messages. That single-writer discipline is the whole concurrency
//! story: no locks, no torn state, and every engine stays a plain
//! synchronous struct that tests can drive directly.
//!
//! The loop multiplexes:
//!
//! - the UDP socket (inbound datagrams, one fixed-size buffer),
//! - an operator-command channel (driven by the console adapter),
//! - a cleanup interval (stale-peer eviction plus the consensus sweep),
//! - a heartbeat interval (gossip presence refresh),
//! - a shutdown watch channel.
//!
//! Engines return actions; the runtime resolves destinations and puts
//! datagrams on the wire, swallowing per-destination send failures. A
//! peer that cannot be reached right now simply misses this round and
//! hears from us again at the next heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config;
use crate::consensus::{ConsensusAction, ConsensusConfig, ConsensusError, OmEngine};
use crate::fault::{FaultInjector, FaultStyle};
use crate::gossip::{GossipEngine, GossipSend, LocalIdentity};
use crate::membership::{self, HostResolver, PeerTable, SystemResolver};
use crate::wire::{self, WireMessage};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything needed to boot a peer node.
pub struct NodeConfig {
    /// UDP port to bind. `None` binds an ephemeral port.
    pub udp_port: Option<u16>,
    /// IPv4 address other peers should use to reach this node. Announced
    /// verbatim; nothing guesses it from interfaces or hostnames.
    pub advertise_host: String,
    /// Operator-chosen display name.
    pub name: String,
    /// TCP port of the operator console, advertised in announcements.
    pub cli_port: u16,
    /// Bootstrap endpoints contacted once at startup.
    pub seeds: Vec<(String, u16)>,
    /// How a lying node picks its faulty values.
    pub fault_style: FaultStyle,
    /// Consensus store tunables.
    pub consensus: ConsensusConfig,
    /// Period of the eviction-and-sweep tick.
    pub cleanup_interval: Duration,
    /// Period of the gossip heartbeat.
    pub heartbeat_interval: Duration,
    /// Hostname resolution, injected for testability.
    pub resolver: Arc<dyn HostResolver>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            udp_port: None,
            advertise_host: "127.0.0.1".to_string(),
            name: config::DEFAULT_NODE_NAME.to_string(),
            cli_port: 0,
            seeds: config::WELL_KNOWN_SEEDS
                .iter()
                .map(|(host, port)| (host.to_string(), *port))
                .collect(),
            fault_style: FaultStyle::Decoy,
            consensus: ConsensusConfig::default(),
            cleanup_interval: config::PEER_CLEANUP_INTERVAL,
            heartbeat_interval: config::HEARTBEAT_INTERVAL,
            resolver: Arc::new(SystemResolver),
        }
    }
}

// ---------------------------------------------------------------------------
// Operator Surface
// ---------------------------------------------------------------------------

/// Snapshot of one known peer, for operator display.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    /// Canonical `"host:port"` key.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Seconds since the last message from this peer.
    pub last_seen_secs: f64,
}

/// Errors surfaced through [`NodeHandle`].
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node loop has shut down; the handle is dangling.
    #[error("node loop has shut down")]
    Gone,
    /// The operation failed inside the consensus engine.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

enum Command {
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Current(oneshot::Sender<[String; config::WORD_SLOTS]>),
    StartConsensus {
        index: i64,
        value: String,
        reply: oneshot::Sender<Result<(), ConsensusError>>,
    },
    SetLying {
        rate: f64,
        reply: oneshot::Sender<f64>,
    },
    SetTruthful(oneshot::Sender<()>),
}

/// Cloneable handle for driving a running node. Every call round-trips
/// through the loop's command channel, so state mutation stays serialized
/// on the loop.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Snapshots the known peers.
    pub async fn peers(&self) -> Result<Vec<PeerSummary>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Peers(reply), rx).await
    }

    /// Snapshots the word array.
    pub async fn current(&self) -> Result<[String; config::WORD_SLOTS], NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Current(reply), rx).await
    }

    /// Initiates a root consensus on `index` with the given value.
    pub async fn start_consensus(&self, index: i64, value: String) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartConsensus { index, value, reply }, rx)
            .await?
            .map_err(NodeError::from)
    }

    /// Enables fault injection at the given rate (clamped to `[0, 1]`).
    /// Returns the rate actually applied.
    pub async fn set_lying(&self, rate: f64) -> Result<f64, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetLying { rate, reply }, rx).await
    }

    /// Disables fault injection.
    pub async fn set_truthful(&self) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetTruthful(reply), rx).await
    }

    async fn send<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T, NodeError> {
        self.tx.send(command).await.map_err(|_| NodeError::Gone)?;
        rx.await.map_err(|_| NodeError::Gone)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A bound-but-not-yet-running peer node.
pub struct PeerNode {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: NodeConfig,
    state: NodeState,
    cmd_rx: mpsc::Receiver<Command>,
}

/// The state owned exclusively by the event loop.
struct NodeState {
    self_key: String,
    peers: PeerTable,
    gossip: GossipEngine,
    consensus: OmEngine,
    fault: FaultInjector,
    words: [String; config::WORD_SLOTS],
    resolver: Arc<dyn HostResolver>,
}

impl PeerNode {
    /// Binds the UDP socket and assembles the runtime. Bind failure is
    /// fatal; everything after this point survives network errors.
    pub async fn bind(config: NodeConfig) -> std::io::Result<(Self, NodeHandle)> {
        let socket = UdpSocket::bind(("0.0.0.0", config.udp_port.unwrap_or(0))).await?;
        let local_addr = socket.local_addr()?;

        let local = LocalIdentity {
            host: config.advertise_host.clone(),
            port: local_addr.port(),
            name: config.name.clone(),
            cli_port: config.cli_port,
        };
        let self_key = local.key();

        let state = NodeState {
            self_key: self_key.clone(),
            peers: PeerTable::new(Arc::clone(&config.resolver)),
            gossip: GossipEngine::new(local),
            consensus: OmEngine::new(self_key, config.consensus.clone()),
            fault: FaultInjector::new(config.fault_style),
            words: Default::default(),
            resolver: Arc::clone(&config.resolver),
        };

        let (tx, cmd_rx) = mpsc::channel(64);
        Ok((
            Self {
                socket,
                local_addr,
                config,
                state,
                cmd_rx,
            },
            NodeHandle { tx },
        ))
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node's canonical membership key.
    pub fn peer_key(&self) -> String {
        self.state.self_key.clone()
    }

    /// Runs the event loop until the shutdown channel flips to `true` or
    /// every handle is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let PeerNode {
            socket,
            local_addr,
            config,
            mut state,
            mut cmd_rx,
        } = self;

        info!(
            addr = %local_addr,
            key = %state.self_key,
            name = %config.name,
            "peer node listening"
        );

        // One-shot presence announcement to the seeds.
        let sends = state.gossip.announce(&config.seeds, Instant::now());
        state.transmit_gossip(&socket, sends).await;

        let mut buf = [0u8; config::MAX_DATAGRAM_BYTES];
        let start = tokio::time::Instant::now();
        let mut cleanup =
            tokio::time::interval_at(start + config.cleanup_interval, config.cleanup_interval);
        let mut heartbeat =
            tokio::time::interval_at(start + config.heartbeat_interval, config.heartbeat_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => state.handle_datagram(&socket, &buf[..len], src).await,
                        Err(err) => debug!(%err, "udp receive failed"),
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => state.handle_command(&socket, command).await,
                        None => break,
                    }
                }
                _ = cleanup.tick() => {
                    let now = Instant::now();
                    let evicted = state.peers.evict_stale(now);
                    if evicted > 0 {
                        debug!(evicted, "evicted stale peers");
                    }
                    let actions = state.consensus.sweep(now);
                    state.apply_consensus(&socket, actions).await;
                }
                _ = heartbeat.tick() => {
                    let sends = state.gossip.heartbeat(&state.peers, Instant::now());
                    state.transmit_gossip(&socket, sends).await;
                }
            }
        }

        info!(key = %state.self_key, "peer node stopped");
    }
}

impl NodeState {
    /// Decodes and dispatches one inbound datagram. Nothing in here may
    /// panic on hostile input; undecodable datagrams are logged and
    /// dropped.
    async fn handle_datagram(&mut self, socket: &UdpSocket, bytes: &[u8], src: SocketAddr) {
        let message = match wire::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(%src, %err, "dropping undecodable datagram");
                return;
            }
        };
        match message {
            WireMessage::Gossip(body) => {
                let src_host = src.ip().to_string();
                let sends = self.gossip.handle_gossip(
                    &body,
                    (src_host.as_str(), src.port()),
                    &mut self.peers,
                    Instant::now(),
                );
                self.transmit_gossip(socket, sends).await;
            }
            WireMessage::GossipReply(body) => {
                self.gossip.handle_reply(&body, &mut self.peers);
            }
            WireMessage::Consensus(body) => {
                let src_host = src.ip().to_string();
                let src_key = membership::peer_key(&src_host, src.port());
                // Child broadcasts include ourselves; our own loopback
                // datagram must not put us in our own peer table.
                if src_key != self.self_key {
                    self.peers.add(&src_host, src.port(), None);
                }
                let actions = self.consensus.handle_incoming(&body, &src_key, &self.fault);
                self.apply_consensus(socket, actions).await;
            }
        }
    }

    /// Executes one operator command against the owned state.
    async fn handle_command(&mut self, socket: &UdpSocket, command: Command) {
        match command {
            Command::Peers(reply) => {
                let now = Instant::now();
                let summaries = self
                    .peers
                    .list()
                    .map(|p| PeerSummary {
                        key: p.key.clone(),
                        name: p.name.clone(),
                        last_seen_secs: now.duration_since(p.last_seen).as_secs_f64(),
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
            Command::Current(reply) => {
                let _ = reply.send(self.words.clone());
            }
            Command::StartConsensus { index, value, reply } => {
                match self
                    .consensus
                    .start_root(index, &value, self.peers.keys(), &self.fault)
                {
                    Ok(actions) => {
                        self.apply_consensus(socket, actions).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::SetLying { rate, reply } => {
                let applied = self.fault.enable(rate);
                info!(rate = applied, "fault injection enabled");
                let _ = reply.send(applied);
            }
            Command::SetTruthful(reply) => {
                self.fault.disable();
                info!("fault injection disabled");
                let _ = reply.send(());
            }
        }
    }

    /// Executes consensus actions: word-array commits locally, sends on
    /// the wire.
    async fn apply_consensus(&mut self, socket: &UdpSocket, actions: Vec<ConsensusAction>) {
        for action in actions {
            match action {
                ConsensusAction::Commit { index, value } => {
                    if index < self.words.len() {
                        self.words[index] = value;
                    }
                }
                ConsensusAction::Send { peer, body } => {
                    let Some(addr) = self.peer_addr(&peer) else {
                        debug!(peer, "cannot address consensus peer");
                        continue;
                    };
                    self.transmit(socket, addr, &WireMessage::Consensus(body)).await;
                }
            }
        }
    }

    /// Transmits gossip work orders, resolving seed hostnames on the way.
    async fn transmit_gossip(&self, socket: &UdpSocket, sends: Vec<GossipSend>) {
        for send in sends {
            let host = self.resolver.resolve_ipv4(&send.host);
            let Ok(addr) = format!("{}:{}", host, send.port).parse::<SocketAddr>() else {
                debug!(host = %send.host, port = send.port, "cannot address gossip target");
                continue;
            };
            self.transmit(socket, addr, &send.message).await;
        }
    }

    /// Puts one message on the wire. Send failures are logged and
    /// swallowed; the peer misses this round and hears from us again at
    /// the next heartbeat.
    async fn transmit(&self, socket: &UdpSocket, addr: SocketAddr, message: &WireMessage) {
        match wire::encode(message) {
            Ok(bytes) => {
                if let Err(err) = socket.send_to(&bytes, addr).await {
                    debug!(%addr, %err, "datagram send failed");
                }
            }
            Err(err) => {
                warn!(%addr, %err, "refusing to send malformed datagram");
            }
        }
    }

    /// Resolves a membership key to a socket address.
    fn peer_addr(&self, key: &str) -> Option<SocketAddr> {
        let (host, port) = membership::split_key(key)?;
        let host = self.resolver.resolve_ipv4(host);
        format!("{}:{}", host, port).parse().ok()
    }
}
