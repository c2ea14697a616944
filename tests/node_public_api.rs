//! Integration tests for the Node public API.
//!
//! Every test starts real nodes on 127.0.0.1 and talks to them only through
//! the public facade.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use splice::{
    BootstrapOutcome, DeliveryError, HandlerRegistry, InboundMessage, Node, NodeConfig, NodeId,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn test_config() -> NodeConfig {
    NodeConfig {
        handshake_timeout: Duration::from_secs(2),
        ping_timeout: Duration::from_secs(1),
        query_timeout: Duration::from_secs(1),
        lookup_timeout: Duration::from_secs(5),
        bootstrap_timeout: Duration::from_secs(8),
        shutdown_timeout: Duration::from_secs(2),
        ..NodeConfig::bound_to(IpAddr::V4(Ipv4Addr::LOCALHOST), next_port())
    }
}

/// Handlers that forward every message for `services` into a channel.
fn recorder(services: &[&str]) -> (HandlerRegistry, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut handlers = HandlerRegistry::new();
    for service in services {
        let tx = tx.clone();
        handlers.register(*service, move |msg| {
            let _ = tx.send(msg);
        });
    }
    (handlers, rx)
}

async fn start(services: &[&str], bootstrap: &str) -> (Node, mpsc::UnboundedReceiver<InboundMessage>) {
    let (handlers, rx) = recorder(services);
    let node = Node::start(test_config(), handlers, bootstrap)
        .await
        .expect("node start failed");
    (node, rx)
}

fn addr_of(node: &Node) -> String {
    node.local_addr().to_string()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {}", what);
}

async fn knows(node: &Node, id: NodeId) -> bool {
    node.known_peers().await.iter().any(|r| r.node_id() == id)
}

#[tokio::test]
async fn node_start_and_identity() {
    let (node, _rx) = start(&["chat"], "").await;

    let hex = node.node_id().to_hex();
    assert_eq!(hex.len(), 64, "node id should be 64 hex chars");
    assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(node.node_id(), NodeId::from_public_key(&node.public_key()));

    assert_eq!(node.local_addr().port(), node.config().port);
    assert_eq!(node.advertised_addr(), node.local_addr());
    assert_eq!(node.bootstrap_outcome().await, BootstrapOutcome::Skipped);
    assert!(node.known_peers().await.is_empty());
    assert!(node.connected_peers().await.is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn invalid_port_is_rejected() {
    let config = NodeConfig {
        port: 0,
        ..test_config()
    };
    let result = Node::start(config, HandlerRegistry::new(), "").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn two_nodes_know_each_other_after_bootstrap() {
    let (a, _ra) = start(&["chat"], "").await;
    let (b, _rb) = start(&["chat"], &addr_of(&a)).await;

    assert!(
        matches!(b.bootstrap_outcome().await, BootstrapOutcome::Joined { responded, .. } if responded >= 1),
        "unexpected outcome: {:?}",
        b.bootstrap_outcome().await
    );

    let (a_id, b_id) = (a.node_id(), b.node_id());
    eventually("b knows a", || knows(&b, a_id)).await;
    eventually("a knows b", || knows(&a, b_id)).await;

    assert!(!knows(&a, a_id).await, "routing table must not contain self");
    assert!(!knows(&b, b_id).await, "routing table must not contain self");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn forgotten_peer_leaves_routing_table_but_keeps_link() {
    let (a, _ra) = start(&["chat"], "").await;
    let (b, _rb) = start(&[], &addr_of(&a)).await;

    let a_id = a.node_id();
    eventually("b knows a", || knows(&b, a_id)).await;

    let record = b.known_peer(&a_id).await.expect("a is in b's table");
    assert_eq!(record.node_id(), a_id);
    assert_eq!(b.known_peer_count().await, 1);

    b.forget(&a_id).await;
    assert!(b.known_peer(&a_id).await.is_none());
    assert_eq!(b.known_peer_count().await, 0);

    let link = b.peer(&a_id).await.expect("link outlives the routing entry");
    assert!(link.is_connected());
    assert_eq!(b.providers_for("chat").await.len(), 1);

    // Forgetting an unknown peer is a no-op.
    b.forget(&b.node_id()).await;
    assert_eq!(b.known_peer_count().await, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn bootstrap_to_self_is_not_fatal() {
    let config = test_config();
    let own = format!("127.0.0.1:{}", config.port);
    let node = Node::start(config, HandlerRegistry::new(), &own)
        .await
        .expect("self bootstrap must not abort start");

    assert!(matches!(node.bootstrap_outcome().await, BootstrapOutcome::Failed(_)));
    assert!(node.known_peers().await.is_empty());
    assert!(node.connected_peers().await.is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn unreachable_bootstrap_is_recorded() {
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = silent.local_addr().unwrap().to_string();

    let (node, _rx) = start(&[], &target).await;
    assert!(matches!(node.bootstrap_outcome().await, BootstrapOutcome::Failed(_)));

    // A later bootstrap can still succeed.
    let (seed, _rs) = start(&[], "").await;
    let outcome = node.bootstrap(&addr_of(&seed)).await;
    assert!(matches!(outcome, BootstrapOutcome::Joined { .. }), "got {:?}", outcome);
    assert_eq!(node.bootstrap_outcome().await, outcome);

    node.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn pushed_payload_arrives_intact() {
    let (b, mut rx) = start(&["echo"], "").await;
    let (a, _ra) = start(&[], &addr_of(&b)).await;

    let b_id = b.node_id();
    eventually("a sees b as echo provider", || async {
        a.providers_for("echo").await.iter().any(|p| p.node_id() == b_id)
    })
    .await;

    let providers = a.providers_for("echo").await;
    assert_eq!(providers.len(), 1);

    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    a.push(&providers[0], "echo", &payload).await.expect("push failed");

    let msg = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");
    assert_eq!(msg.service, "echo");
    assert_eq!(msg.payload, payload);
    assert_eq!(msg.from, a.node_id());
    assert_eq!(msg.public_key, a.public_key());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unknown_service_is_dropped_silently() {
    let (b, mut rx) = start(&["chat"], "").await;
    let (a, _ra) = start(&[], &addr_of(&b)).await;

    let b_id = b.node_id();
    eventually("a sees b", || async {
        a.providers_for("chat").await.iter().any(|p| p.node_id() == b_id)
    })
    .await;
    let peer = a.providers_for("chat").await.remove(0);

    a.push(&peer, "no-such-service", b"ignored").await.expect("push is best effort");
    a.push(&peer, "chat", b"delivered").await.expect("push failed");

    let msg = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.payload, b"delivered".to_vec());
    assert!(rx.try_recv().is_err());
    assert!(peer.is_connected(), "unknown service must not close the link");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn providers_never_include_local_node() {
    let (a, _ra) = start(&["chat"], "").await;
    let (b, _rb) = start(&["chat"], &addr_of(&a)).await;

    let b_id = b.node_id();
    eventually("a sees b", || async { a.providers_for("chat").await.len() == 1 }).await;

    let providers = a.providers_for("chat").await;
    assert!(providers.iter().all(|p| p.node_id() != a.node_id()));
    assert_eq!(providers[0].node_id(), b_id);
    assert_eq!(a.services_of(&b_id).await, vec!["chat".to_string()]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn push_isolates_failures_per_peer() {
    let (hub, _rh) = start(&[], "").await;
    let hub_addr = addr_of(&hub);

    let mut providers = Vec::new();
    for _ in 0..5 {
        providers.push(start(&["svc"], &hub_addr).await);
    }

    eventually("hub sees five providers", || async {
        hub.providers_for("svc").await.len() == 5
    })
    .await;
    let snapshot = hub.providers_for("svc").await;

    let gone: Vec<NodeId> = snapshot[..2].iter().map(|p| p.node_id()).collect();
    for (node, _) in &providers {
        if gone.contains(&node.node_id()) {
            node.shutdown().await;
        }
    }

    eventually("hub notices two disconnects", || async {
        hub.providers_for("svc").await.len() == 3
    })
    .await;
    assert_eq!(snapshot.len(), 5, "snapshot is unaffected by disconnects");

    let mut delivered = 0;
    let mut failed = 0;
    for peer in &snapshot {
        match hub.push(peer, "svc", b"ping").await {
            Ok(()) => delivered += 1,
            Err(e) => {
                assert_eq!(e, DeliveryError::Closed);
                assert!(gone.contains(&peer.node_id()));
                failed += 1;
            }
        }
    }
    assert_eq!((delivered, failed), (3, 2));

    let deliveries = hub.broadcast("svc", b"fanout").await;
    assert_eq!(deliveries.len(), 3);
    assert!(deliveries.iter().all(|d| d.result.is_ok()));

    hub.shutdown().await;
    for (node, _) in &providers {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn broadcast_reports_in_snapshot_order() {
    let (hub, _rh) = start(&[], "").await;
    let hub_addr = addr_of(&hub);

    let mut providers = Vec::new();
    for _ in 0..3 {
        providers.push(start(&["news"], &hub_addr).await);
    }
    eventually("hub sees providers", || async {
        hub.providers_for("news").await.len() == 3
    })
    .await;

    let order: Vec<NodeId> = hub
        .providers_for("news")
        .await
        .iter()
        .map(|p| p.node_id())
        .collect();
    let deliveries = hub.broadcast("news", b"headline").await;
    let reported: Vec<NodeId> = deliveries.iter().map(|d| d.peer).collect();
    assert_eq!(reported, order);

    for (_, rx) in providers.iter_mut() {
        let msg = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"headline".to_vec());
        assert_eq!(msg.from, hub.node_id());
    }

    assert!(hub.broadcast("nobody", b"x").await.is_empty());

    hub.shutdown().await;
    for (node, _) in &providers {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn concurrent_shutdown_is_idempotent() {
    let (a, _ra) = start(&["chat"], "").await;
    let (b, _rb) = start(&["chat"], &addr_of(&a)).await;

    let finished = timeout(TEST_TIMEOUT, async {
        tokio::join!(a.shutdown(), a.shutdown());
    })
    .await;
    assert!(finished.is_ok(), "concurrent shutdowns must both return");
    assert!(a.is_shut_down());

    timeout(Duration::from_millis(100), a.shutdown())
        .await
        .expect("repeat shutdown returns immediately");

    let a_id = a.node_id();
    eventually("b notices a left", || async {
        b.connected_peers().await.iter().all(|p| p.node_id() != a_id)
    })
    .await;

    b.shutdown().await;
}
