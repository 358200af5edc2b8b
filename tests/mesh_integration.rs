//! Multi-node integration tests: gossip convergence, multi-hop routing,
//! response aggregation and degree maintenance over loopback QUIC.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meshage::{CommandHandler, MeshConfig, MeshError, Node, NodeName, Response};
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(32000);

fn test_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimal interpreter: `hostname`, `echo <text>`, `sleep <ms>`.
struct TestHandler;

enum TestCommand {
    Hostname,
    Echo(String),
    Sleep(u64),
}

#[async_trait]
impl CommandHandler for TestHandler {
    type Command = TestCommand;

    fn compile(&self, original: &str) -> Result<TestCommand, MeshError> {
        let (head, rest) = original.split_once(' ').unwrap_or((original, ""));
        match head {
            "hostname" => Ok(TestCommand::Hostname),
            "echo" => Ok(TestCommand::Echo(rest.to_string())),
            "sleep" => rest
                .parse()
                .map(TestCommand::Sleep)
                .map_err(|_| MeshError::Parse(original.to_string())),
            _ => Err(MeshError::Parse(original.to_string())),
        }
    }

    async fn execute(&self, command: TestCommand) -> Result<Vec<Response>, MeshError> {
        let body = match command {
            TestCommand::Hostname => String::new(),
            TestCommand::Echo(text) => text,
            TestCommand::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                "awake".to_string()
            }
        };
        // The dispatcher stamps the host.
        Ok(vec![Response::new("").with_body(body)])
    }
}

fn config(name: &str) -> MeshConfig {
    MeshConfig::new(name.parse().expect("valid name"))
        .with_bind(test_addr().parse().expect("valid addr"))
        .with_gossip_interval(Duration::from_millis(500))
}

async fn spawn_node(name: &str) -> Arc<Node> {
    spawn_with(config(name)).await
}

async fn spawn_with(config: MeshConfig) -> Arc<Node> {
    let node = Arc::new(Node::bind(config).await.expect("bind failed"));
    node.serve(TestHandler).await.expect("serve failed");
    node
}

async fn connect(from: &Node, to: &Node) {
    let addr = to.local_addr().unwrap().to_string();
    from.dial(&addr).await.expect("dial failed");
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn wait_for_mesh_size(nodes: &[Arc<Node>], size: usize) {
    for node in nodes {
        let node = node.clone();
        wait_until("mesh convergence", || {
            let node = node.clone();
            async move { node.mesh().await.map(|m| m.len() == size).unwrap_or(false) }
        })
        .await;
    }
}

/// n1 - n2 - n3 - n4
async fn line() -> Vec<Arc<Node>> {
    let mut nodes = Vec::new();
    for i in 1..=4 {
        nodes.push(spawn_node(&format!("line{}", i)).await);
    }
    for pair in nodes.windows(2) {
        connect(&pair[0], &pair[1]).await;
    }
    wait_for_mesh_size(&nodes, 4).await;
    nodes
}

async fn shutdown(nodes: &[Arc<Node>]) {
    for node in nodes {
        node.shutdown().await;
    }
}

fn hosts(responses: &[Response]) -> Vec<String> {
    let mut hosts: Vec<String> = responses.iter().map(|r| r.host.clone()).collect();
    hosts.sort();
    hosts
}

#[tokio::test]
async fn command_reaches_node_several_hops_away() {
    let nodes = line().await;
    let result = nodes[0].send("line4", "echo far").await.unwrap();
    assert!(result.is_complete(), "missing {:?}", result.missing);
    assert_eq!(result.responses.len(), 1);
    assert_eq!(result.responses[0].host, "line4");
    assert_eq!(result.responses[0].body, "far");
    shutdown(&nodes).await;
}

#[tokio::test]
async fn send_all_collects_every_node_including_self() {
    let nodes = line().await;
    let result = nodes[1].send("all", "hostname").await.unwrap();
    assert!(result.is_complete(), "missing {:?}", result.missing);
    assert_eq!(hosts(&result.responses), vec!["line1", "line2", "line3", "line4"]);
    shutdown(&nodes).await;
}

#[tokio::test]
async fn range_expression_selects_subset() {
    let nodes = line().await;
    let result = nodes[3].send("line[1-2]", "hostname").await.unwrap();
    assert!(result.is_complete());
    assert_eq!(hosts(&result.responses), vec!["line1", "line2"]);
    shutdown(&nodes).await;
}

#[tokio::test]
async fn complete_request_returns_before_timeout() {
    let nodes = line().await;
    nodes[0].set_timeout(Duration::from_secs(30));
    let started = Instant::now();
    let result = nodes[0].send("line[2-4]", "hostname").await.unwrap();
    assert!(result.is_complete());
    assert!(started.elapsed() < Duration::from_secs(10));
    shutdown(&nodes).await;
}

#[tokio::test]
async fn slow_target_yields_partial_result_after_timeout() {
    let a = spawn_node("slow-a").await;
    let b = spawn_node("slow-b").await;
    connect(&a, &b).await;
    wait_for_mesh_size(&[a.clone(), b.clone()], 2).await;

    a.set_timeout(Duration::from_secs(1));
    let started = Instant::now();
    let result = a.send("slow-b", "sleep 3000").await.unwrap();
    let elapsed = started.elapsed();

    assert!(result.responses.is_empty());
    assert_eq!(result.missing, vec![NodeName::new("slow-b").unwrap()]);
    assert!(elapsed >= Duration::from_millis(950), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "returned after {:?}", elapsed);

    // The late response is discarded; the next request is unaffected.
    a.set_timeout(Duration::from_secs(10));
    let result = a.send("slow-b", "echo next").await.unwrap();
    assert_eq!(result.responses.len(), 1);
    assert_eq!(result.responses[0].body, "next");
    shutdown(&[a, b]).await;
}

#[tokio::test]
async fn partial_result_keeps_answers_from_live_hosts() {
    let nodes = line().await;
    nodes[0].set_timeout(Duration::from_secs(1));
    let result = nodes[0].send("line3,ghost", "hostname").await.unwrap();
    assert_eq!(hosts(&result.responses), vec!["line3"]);
    assert_eq!(result.missing, vec![NodeName::new("ghost").unwrap()]);
    shutdown(&nodes).await;
}

#[tokio::test]
async fn concurrent_requests_do_not_mix_responses() {
    let nodes = line().await;
    let origin = nodes[0].clone();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let origin = origin.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("payload-{}", i);
            let result = origin
                .send("line3,line4", &format!("echo {}", text))
                .await
                .unwrap();
            (text, result)
        }));
    }
    for task in tasks {
        let (text, result) = task.await.unwrap();
        assert!(result.is_complete(), "missing {:?}", result.missing);
        assert_eq!(result.responses.len(), 2);
        for response in &result.responses {
            assert_eq!(response.body, text);
        }
    }
    shutdown(&nodes).await;
}

#[tokio::test]
async fn dot_has_one_edge_per_adjacency_entry() {
    let nodes = line().await;
    let mesh = nodes[2].mesh().await.unwrap();
    let entries: usize = mesh.values().map(Vec::len).sum();
    // Three links, each listed by both ends.
    assert_eq!(entries, 6);

    let graph = nodes[2].dot().await.unwrap();
    assert_eq!(graph.matches("->").count(), entries);
    assert!(graph.contains("\"line1\" -> \"line2\";"));
    shutdown(&nodes).await;
}

#[tokio::test]
async fn hangup_propagates_to_remote_views() {
    let nodes = line().await;
    nodes[2].hangup("line4").await.unwrap();

    let observer = nodes[0].clone();
    wait_until("line4 to leave line1's view", || {
        let observer = observer.clone();
        async move {
            observer
                .mesh()
                .await
                .map(|m| !m.contains_key(&NodeName::new("line4").unwrap()))
                .unwrap_or(false)
        }
    })
    .await;

    observer.set_timeout(Duration::from_millis(500));
    let result = observer.send("line4", "hostname").await.unwrap();
    assert!(result.responses.is_empty());
    shutdown(&nodes).await;
}

#[tokio::test]
async fn auto_dial_fills_degree_without_exceeding_it() {
    // Star around a hub; every leaf knows the others through the hub.
    let hub = spawn_node("hub").await;
    let mut leaves = Vec::new();
    for i in 0..4 {
        let leaf = spawn_node(&format!("leaf{}", i)).await;
        connect(&leaf, &hub).await;
        leaves.push(leaf);
    }
    let mut all = leaves.clone();
    all.push(hub.clone());
    wait_for_mesh_size(&all, 5).await;

    let leaf = leaves[0].clone();
    leaf.set_degree(3).await.unwrap();
    wait_until("leaf0 to reach its degree", || {
        let leaf = leaf.clone();
        async move { leaf.status().await.map(|s| s.peers == 3).unwrap_or(false) }
    })
    .await;

    // Several more gossip ticks must not push it past the degree.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(leaf.status().await.unwrap().peers, 3);

    // Lowering the degree keeps existing links.
    leaf.set_degree(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(leaf.status().await.unwrap().peers, 3);
    shutdown(&all).await;
}

#[tokio::test]
async fn simultaneous_dials_leave_a_single_link() {
    let a = spawn_node("duel-a").await;
    let b = spawn_node("duel-b").await;
    let a_addr = a.local_addr().unwrap().to_string();
    let b_addr = b.local_addr().unwrap().to_string();

    let (ra, rb) = tokio::join!(a.dial(&b_addr), b.dial(&a_addr));
    assert!(ra.is_ok() || rb.is_ok(), "both dials failed: {:?} / {:?}", ra, rb);

    for node in [&a, &b] {
        let node = node.clone();
        wait_until("exactly one link", || {
            let node = node.clone();
            async move { node.status().await.map(|s| s.peers == 1).unwrap_or(false) }
        })
        .await;
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(a.status().await.unwrap().peers, 1);
    assert_eq!(b.status().await.unwrap().peers, 1);

    let result = a.send("duel-b", "echo ok").await.unwrap();
    assert_eq!(result.responses.len(), 1);
    shutdown(&[a, b]).await;
}

#[tokio::test]
async fn hop_cap_stops_envelopes_past_the_limit() {
    // hops0 - hops1 - hops2, where hops0 allows one forward and hops2
    // allows none.
    let first = spawn_with(config("hops0").with_max_hops(1)).await;
    let middle = spawn_node("hops1").await;
    let last = spawn_with(config("hops2").with_max_hops(0)).await;
    connect(&first, &middle).await;
    connect(&middle, &last).await;
    let nodes = vec![first.clone(), middle.clone(), last.clone()];
    wait_for_mesh_size(&nodes, 3).await;

    first.set_timeout(Duration::from_millis(800));
    let result = first.send("hops1,hops2", "hostname").await.unwrap();
    assert_eq!(hosts(&result.responses), vec!["hops1"]);
    assert_eq!(result.missing, vec![NodeName::new("hops2").unwrap()]);

    // With no hops left, only local delivery happens.
    last.set_timeout(Duration::from_millis(800));
    let result = last.send("hops2,hops1", "hostname").await.unwrap();
    assert_eq!(hosts(&result.responses), vec!["hops2"]);
    assert_eq!(result.missing, vec![NodeName::new("hops1").unwrap()]);

    // Replies travel under the replier's cap: one hop back from hops0 fits.
    let result = middle.send("hops0,hops1", "hostname").await.unwrap();
    assert!(result.is_complete(), "missing {:?}", result.missing);
    shutdown(&nodes).await;
}
