//! End-to-end exercises over real loopback UDP sockets.
//!
//! These tests boot whole peer nodes, let them discover each other through
//! gossip, and drive agreement through the operator handle. Timers are
//! tightened so stalled instances settle in well under a second.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

use chorus_protocol::consensus::ConsensusConfig;
use chorus_protocol::node::{NodeConfig, NodeHandle, PeerNode, PeerSummary};
use chorus_protocol::wire::{self, GossipBody, WireMessage};

fn fast_config(seeds: Vec<(String, u16)>) -> NodeConfig {
    NodeConfig {
        seeds,
        cleanup_interval: Duration::from_millis(100),
        // Effectively off: no heartbeat noise inside short tests.
        heartbeat_interval: Duration::from_secs(600),
        consensus: ConsensusConfig {
            instance_timeout: Duration::from_millis(400),
            ..ConsensusConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn spawn_node(seeds: Vec<(String, u16)>) -> (NodeHandle, SocketAddr, watch::Sender<bool>) {
    let (node, handle) = PeerNode::bind(fast_config(seeds)).await.expect("bind node");
    let addr = node.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(node.run(shutdown_rx));
    (handle, addr, shutdown_tx)
}

fn seed(addr: SocketAddr) -> (String, u16) {
    ("127.0.0.1".to_string(), addr.port())
}

fn keys(peers: Vec<PeerSummary>) -> Vec<String> {
    peers.into_iter().map(|p| p.key).collect()
}

fn loopback_key(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port())
}

async fn recv_message(socket: &UdpSocket) -> Option<WireMessage> {
    let mut buf = [0u8; 4096];
    match timeout(Duration::from_millis(400), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => wire::decode(&buf[..len]).ok(),
        _ => None,
    }
}

#[tokio::test]
async fn lone_node_commits_its_own_word() {
    let (handle, _, _shutdown) = spawn_node(vec![]).await;

    handle
        .start_consensus(0, "hello".to_string())
        .await
        .expect("consensus starts");

    let words = handle.current().await.expect("snapshot");
    assert_eq!(words[0], "hello");
    assert!(words[1..].iter().all(|w| w.is_empty()));
}

#[tokio::test]
async fn gossip_spreads_membership() {
    let (handle_a, addr_a, _sa) = spawn_node(vec![]).await;
    let (handle_b, addr_b, _sb) = spawn_node(vec![seed(addr_a)]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (_handle_c, addr_c, _sc) = spawn_node(vec![seed(addr_a)]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A heard both announcements directly.
    let a = keys(handle_a.peers().await.unwrap());
    assert!(a.contains(&loopback_key(addr_b)));
    assert!(a.contains(&loopback_key(addr_c)));

    // B learned A from its greeting and C from A's forwarding.
    let b = keys(handle_b.peers().await.unwrap());
    assert!(b.contains(&loopback_key(addr_a)));
    assert!(b.contains(&loopback_key(addr_c)));
}

#[tokio::test]
async fn three_nodes_converge_on_an_initiated_word() {
    let (handle_a, addr_a, _sa) = spawn_node(vec![]).await;
    let (handle_b, addr_b, _sb) = spawn_node(vec![seed(addr_a)]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (handle_c, _addr_c, _sc) = spawn_node(vec![seed(addr_a), seed(addr_b)]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    handle_a
        .start_consensus(2, "foo".to_string())
        .await
        .expect("consensus starts");

    // Three participants means m = 0: leaf instances wait on reports that
    // never come and settle through the timeout sweep.
    tokio::time::sleep(Duration::from_millis(900)).await;

    for handle in [&handle_a, &handle_b, &handle_c] {
        let words = handle.current().await.expect("snapshot");
        assert_eq!(words[2], "foo");
    }
}

#[tokio::test]
async fn four_honest_nodes_agree_through_one_fault_level() {
    let (handle_a, addr_a, _sa) = spawn_node(vec![]).await;
    let (handle_b, addr_b, _sb) = spawn_node(vec![seed(addr_a)]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (handle_c, addr_c, _sc) = spawn_node(vec![seed(addr_a), seed(addr_b)]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (handle_d, _addr_d, _sd) =
        spawn_node(vec![seed(addr_a), seed(addr_b), seed(addr_c)]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    handle_a
        .start_consensus(1, "alpha".to_string())
        .await
        .expect("consensus starts");

    // n = 4 gives m = 1: every lieutenant relays the commander's value in
    // a sub-consensus before anything settles.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    for handle in [&handle_a, &handle_b, &handle_c, &handle_d] {
        let words = handle.current().await.expect("snapshot");
        assert_eq!(words[1], "alpha");
    }
}

#[tokio::test]
async fn one_liar_among_four_cannot_break_the_honest_majority() {
    let (handle_a, addr_a, _sa) = spawn_node(vec![]).await;
    let (handle_b, addr_b, _sb) = spawn_node(vec![seed(addr_a)]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (handle_c, addr_c, _sc) = spawn_node(vec![seed(addr_a), seed(addr_b)]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (handle_d, _addr_d, _sd) =
        spawn_node(vec![seed(addr_a), seed(addr_b), seed(addr_c)]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // D equivocates on every outgoing edge.
    handle_d.set_lying(1.0).await.expect("enable lying");

    handle_a
        .start_consensus(3, "alpha".to_string())
        .await
        .expect("consensus starts");
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Classic OM(1): the three honest nodes still agree with each other.
    let a = handle_a.current().await.unwrap()[3].clone();
    let b = handle_b.current().await.unwrap()[3].clone();
    let c = handle_c.current().await.unwrap()[3].clone();
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a, "alpha");
}

#[tokio::test]
async fn duplicate_gossip_is_forwarded_at_most_once() {
    let (_handle, addr_n, _s) = spawn_node(vec![]).await;
    let node_addr: SocketAddr = format!("127.0.0.1:{}", addr_n.port()).parse().unwrap();

    let fake_1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let announce = |id: &str, port: u16| {
        wire::encode(&WireMessage::Gossip(GossipBody {
            host: "127.0.0.1".to_string(),
            port,
            name: "fake".to_string(),
            id: id.to_string(),
            cli_port: 1,
        }))
        .unwrap()
    };
    let port_1 = fake_1.local_addr().unwrap().port();
    let port_2 = fake_2.local_addr().unwrap().port();

    // Register both fakes with the node, then drain the greetings (and
    // the forward of fake 2's announcement that fake 1 receives).
    fake_1.send_to(&announce("g-f1", port_1), node_addr).await.unwrap();
    fake_2.send_to(&announce("g-f2", port_2), node_addr).await.unwrap();
    while recv_message(&fake_1).await.is_some() {}
    while recv_message(&fake_2).await.is_some() {}

    // A novel id sent twice from fake 1 must reach fake 2 exactly once.
    let novel = announce("g-novel", port_1);
    fake_1.send_to(&novel, node_addr).await.unwrap();
    fake_1.send_to(&novel, node_addr).await.unwrap();

    let mut copies = 0;
    while let Some(message) = recv_message(&fake_2).await {
        if let WireMessage::Gossip(body) = message {
            if body.id == "g-novel" {
                copies += 1;
            }
        }
    }
    assert_eq!(copies, 1);
}
