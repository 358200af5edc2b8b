//! Integration tests for the Node public API.
//!
//! These tests exercise the public interface exposed through the Node facade
//! on single nodes and small pairs over loopback QUIC.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use meshage::{CliHandler, MeshConfig, MeshError, Node, NodeName};
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Helper to allocate unique ports for test nodes
fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config(name: &str) -> MeshConfig {
    MeshConfig::new(name.parse().expect("valid name"))
        .with_bind(test_addr().parse().expect("valid addr"))
        .with_gossip_interval(Duration::from_millis(500))
}

async fn bind(name: &str) -> Arc<Node> {
    let node = Arc::new(Node::bind(config(name)).await.expect("bind failed"));
    node.serve(CliHandler::new(node.clone()))
        .await
        .expect("serve failed");
    node
}

async fn wait_for_peers(node: &Node, peers: usize) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if node.status().await.expect("status").peers == peers {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {} peers", node.name(), peers));
}

#[tokio::test]
async fn node_bind_and_name() {
    let node = bind("kn1").await;
    assert_eq!(node.name().as_str(), "kn1");
    let local_addr = node.local_addr().expect("local_addr failed");
    assert!(local_addr.port() > 0, "port should be positive");
    node.shutdown().await;
}

#[tokio::test]
async fn fresh_node_status_reports_only_itself() {
    let node = Arc::new(
        Node::bind(config("fresh").with_degree(3))
            .await
            .expect("bind failed"),
    );
    let status = node.status().await.expect("status");
    assert_eq!(status.mesh_size, 1);
    assert_eq!(status.degree, 3);
    assert_eq!(status.peers, 0);

    let mesh = node.mesh().await.expect("mesh");
    assert_eq!(mesh.len(), 1);
    assert!(mesh[node.name()].is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn degree_can_be_read_and_changed() {
    let node = bind("deg").await;
    assert_eq!(node.degree().await.unwrap(), 0);
    node.set_degree(4).await.unwrap();
    assert_eq!(node.degree().await.unwrap(), 4);
    node.set_degree(1).await.unwrap();
    assert_eq!(node.degree().await.unwrap(), 1);
    node.shutdown().await;
}

#[tokio::test]
async fn timeout_can_be_read_and_changed() {
    let node = bind("tmo").await;
    assert_eq!(node.timeout(), meshage::DEFAULT_TIMEOUT);
    node.set_timeout(Duration::from_secs(3));
    assert_eq!(node.timeout(), Duration::from_secs(3));
    node.shutdown().await;
}

#[tokio::test]
async fn hangup_without_link_is_not_connected() {
    let node = bind("lonely").await;
    match node.hangup("kn9").await {
        Err(MeshError::NotConnected(name)) => assert_eq!(name, "kn9"),
        other => panic!("expected NotConnected, got {:?}", other),
    }
    node.shutdown().await;
}

#[tokio::test]
async fn dialing_self_fails() {
    let node = bind("narcissus").await;
    let by_name = node.dial("narcissus").await;
    assert!(matches!(by_name, Err(MeshError::Connect(_))));

    let addr = node.local_addr().unwrap().to_string();
    let by_addr = node.dial(&addr).await;
    assert!(
        matches!(by_addr, Err(MeshError::Connect(ref msg)) if msg.contains("self")),
        "got {:?}",
        by_addr
    );
    assert_eq!(node.status().await.unwrap().peers, 0);
    node.shutdown().await;
}

#[tokio::test]
async fn dial_then_hangup_updates_both_sides() {
    let a = bind("pair-a").await;
    let b = bind("pair-b").await;

    let b_addr = b.local_addr().unwrap().to_string();
    let name = a.dial(&b_addr).await.expect("dial failed");
    assert_eq!(name, NodeName::new("pair-b").unwrap());
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;

    let again = a.dial("pair-b").await;
    assert!(
        matches!(again, Err(MeshError::Connect(ref msg)) if msg.contains("already connected")),
        "got {:?}",
        again
    );

    a.hangup("pair-b").await.expect("hangup failed");
    assert_eq!(a.status().await.unwrap().peers, 0);
    let mesh = a.mesh().await.unwrap();
    assert!(!mesh[a.name()].iter().any(|peer| *peer == "pair-b"));
    wait_for_peers(&b, 0).await;

    assert!(matches!(
        a.hangup("pair-b").await,
        Err(MeshError::NotConnected(_))
    ));
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn redialing_by_address_keeps_the_existing_link() {
    let a = bind("addr-a").await;
    let b = bind("addr-b").await;

    let b_addr = b.local_addr().unwrap().to_string();
    a.dial(&b_addr).await.expect("dial failed");
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;

    let again = a.dial(&b_addr).await;
    assert!(
        matches!(again, Err(MeshError::Connect(ref msg)) if msg.contains("already connected")),
        "got {:?}",
        again
    );

    // The refused handshake must not disturb the original link.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.status().await.unwrap().peers, 1);
    assert_eq!(b.status().await.unwrap().peers, 1);
    let result = a.send("addr-b", "hostname").await.unwrap();
    assert_eq!(result.responses.len(), 1);
    assert_eq!(result.responses[0].body, "addr-b");
    assert!(result.missing.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn dial_unreachable_address_fails() {
    let node = bind("dialer").await;
    // Nothing listens on this port.
    let result = node.dial(&test_addr()).await;
    assert!(matches!(result, Err(MeshError::Connect(_))), "got {:?}", result);
    node.shutdown().await;
}

#[tokio::test]
async fn handler_can_only_be_installed_once() {
    let node = bind("once").await;
    assert!(node.serve(CliHandler::new(node.clone())).await.is_err());
    node.shutdown().await;
}

#[tokio::test]
async fn malformed_recipients_are_rejected_before_sending() {
    let node = bind("sender").await;
    let result = node.send("kn[1-", "hostname").await;
    assert!(matches!(result, Err(MeshError::RangeSyntax(_))));
    node.shutdown().await;
}

#[tokio::test]
async fn send_to_unreachable_host_reports_it_missing() {
    let node = bind("islander").await;
    node.set_timeout(Duration::from_millis(300));
    let result = node.send("islander,nobody", "hostname").await.unwrap();
    assert_eq!(result.responses.len(), 1);
    assert_eq!(result.responses[0].body, "islander");
    assert_eq!(result.missing, vec![NodeName::new("nobody").unwrap()]);
    node.shutdown().await;
}
