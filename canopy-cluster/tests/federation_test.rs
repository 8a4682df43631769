//! End-to-end tests over loopback sockets
//!
//! Each test builds a small tree of real nodes, each with its own
//! listener, and observes it through routing tables and the root's store.

use async_trait::async_trait;
use canopy_cluster::{
    BackendRequest, BackendResponse, ClusterConfig, ClusterNode, Destination, Handler, HandlerRegistry,
    MemoryStore, RecordStore, Result,
};
use std::sync::Arc;
use std::time::Duration;

// ── Helpers ─────────────────────────────────────────────────────────────────

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, request: BackendRequest) -> Result<BackendResponse> {
        Ok(BackendResponse {
            code: 200,
            body: format!("{} {} {}", request.method, request.path, request.body),
            timestamp: canopy_cluster::now_millis(),
        })
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

fn handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("echo", Arc::new(Echo));
    handlers
}

fn config(name: &str, parent: Option<String>) -> ClusterConfig {
    ClusterConfig {
        listen_addr: "127.0.0.1:0".into(),
        parent_addr: parent,
        connect_timeout_ms: 500,
        reconnect_backoff_ms: 50,
        failover_cooldown_ms: 200,
        shutdown_grace_ms: 500,
        ..ClusterConfig::named(name)
    }
}

async fn start_root(name: &str) -> (ClusterNode, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let node = ClusterNode::start(config(name, None), handlers(), Some(store.clone()))
        .await
        .unwrap();
    (node, store)
}

async fn start_child(name: &str, parent: &ClusterNode) -> ClusterNode {
    ClusterNode::start(config(name, Some(parent.local_addr().to_string())), handlers(), None)
        .await
        .unwrap()
}

/// Poll `condition` until it holds or five seconds pass
async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn cluster_names(store: &MemoryStore) -> Vec<String> {
    let mut names: Vec<String> = store
        .list_clusters("default")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    names
}

async fn wait_for_clusters(store: &MemoryStore, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let names = cluster_names(store).await;
        if names == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected clusters {:?}, found {:?}",
            expected,
            names
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Registration ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tree_registers_at_root() {
    let (root, store) = start_root("root").await;
    let c1 = start_child("c1", &root).await;
    let g1 = start_child("g1", &c1).await;

    wait_for_clusters(&store, &["c1", "g1"]).await;
    assert!(root.table().has_route("g1", "c1"));
    assert!(c1.table().has_route("g1", "g1"));
    assert_eq!(root.connected_children(), vec!["c1".to_string()]);

    let record = store.get_cluster("default", "g1").await.unwrap().unwrap();
    assert_eq!(record.parent, "c1");
    assert_eq!(record.listen_addr, g1.local_addr().to_string());

    g1.shutdown().await;
    wait_for_clusters(&store, &["c1"]).await;
    assert!(!root.table().has_route("g1", "c1"));

    c1.shutdown().await;
    root.shutdown().await;
}

#[tokio::test]
async fn test_gossip_reaches_grandchildren() {
    let (root, _store) = start_root("root").await;
    let c1 = start_child("c1", &root).await;
    let c2 = start_child("c2", &root).await;
    let g1 = start_child("g1", &c1).await;

    let c1_addr = c1.local_addr().to_string();
    let c2_addr = c2.local_addr().to_string();
    wait_for("parent neighbors at g1", || {
        let pn = g1.table().parent_neighbors();
        pn.get("c1") == Some(&c1_addr) && pn.get("c2") == Some(&c2_addr)
    })
    .await;
    wait_for("neighbors at c1", || c1.table().neighbors().contains_key("c2")).await;

    for node in [g1, c2, c1, root] {
        node.shutdown().await;
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_reaches_selected_clusters_and_statuses_merge() {
    let (root, store) = start_root("root").await;
    let c1 = start_child("c1", &root).await;
    let c3 = start_child("c3", &root).await;
    let c2 = start_child("c2", &c3).await;
    wait_for_clusters(&store, &["c1", "c2", "c3"]).await;

    let body = serde_json::to_string(&BackendRequest {
        method: "GET".into(),
        path: "/status".into(),
        body: String::new(),
    })
    .unwrap();
    let submitted = root
        .submit("c2,root", Destination::Backend("echo".into()), body)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let record = loop {
        let record = store.get_task("default", &submitted.id).await.unwrap().unwrap();
        if record.message.status.len() == 2 {
            break record;
        }
        assert!(tokio::time::Instant::now() < deadline, "statuses: {:?}", record.message.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(record.message.status["c2"].code, 200);
    assert_eq!(record.message.status["c2"].body, "GET /status ");
    assert_eq!(record.message.status["root"].code, 200);
    // c1 and c3 were not selected
    assert!(!record.message.status.contains_key("c1"));
    assert!(!record.message.status.contains_key("c3"));

    for node in [c2, c3, c1, root] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_missing_handler_reports_failure_status() {
    let (root, store) = start_root("root").await;
    let c1 = start_child("c1", &root).await;
    wait_for_clusters(&store, &["c1"]).await;

    let submitted = root
        .submit("c1", Destination::Backend("nope".into()), "{}")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = store.get_task("default", &submitted.id).await.unwrap().unwrap();
        if let Some(status) = record.message.status.get("c1") {
            assert_eq!(status.code, canopy_cluster::HANDLER_ERROR_CODE);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no status from c1");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    c1.shutdown().await;
    root.shutdown().await;
}

// ── Failover ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_edge_fails_over_to_parent_neighbor() {
    let (root, store) = start_root("root").await;
    let p1 = start_child("p1", &root).await;
    let p2 = start_child("p2", &root).await;
    let leaf = start_child("leaf", &p1).await;
    wait_for_clusters(&store, &["leaf", "p1", "p2"]).await;

    let p1_addr = p1.local_addr().to_string();
    let p2_addr = p2.local_addr().to_string();
    wait_for("parent neighbors at leaf", || {
        let pn = leaf.table().parent_neighbors();
        pn.contains_key("p1") && pn.contains_key("p2")
    })
    .await;
    assert_eq!(leaf.parent_target(), Some(p1_addr.clone()));

    p1.shutdown().await;

    wait_for("leaf attached to p2", || {
        leaf.parent_target() == Some(p2_addr.clone()) && leaf.is_parent_connected()
    })
    .await;
    // the failed-address set only lives while the node has no parent
    let edge = leaf.edge().unwrap();
    assert_eq!(edge.failover_len(), 0);

    wait_for("route to leaf through p2", || root.table().has_route("leaf", "p2")).await;
    wait_for_clusters(&store, &["leaf", "p2"]).await;

    for node in [leaf, p2, root] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_reattached_subtree_is_reported() {
    let (root, store) = start_root("root").await;
    let p1 = start_child("p1", &root).await;
    let p2 = start_child("p2", &root).await;
    let mid = start_child("mid", &p1).await;
    let leaf = start_child("leaf", &mid).await;
    wait_for_clusters(&store, &["leaf", "mid", "p1", "p2"]).await;
    wait_for("parent neighbors at mid", || mid.table().parent_neighbors().len() == 2).await;

    p1.shutdown().await;

    // mid moves to p2 and reports leaf in its subtree report
    wait_for("route to leaf through p2", || root.table().has_route("leaf", "p2")).await;
    assert!(p2.table().has_route("leaf", "mid"));
    assert!(p2.table().has_route("mid", "mid"));
    wait_for_clusters(&store, &["leaf", "mid", "p2"]).await;

    for node in [leaf, mid, p2, root] {
        node.shutdown().await;
    }
}

// ── Duplicate names ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_child_name_keeps_first_link() {
    let (root, store) = start_root("root").await;
    let first = start_child("dup", &root).await;
    let second = start_child("dup", &root).await;

    wait_for_clusters(&store, &["dup"]).await;
    wait_for("one side attached", || first.is_parent_connected() || second.is_parent_connected()).await;
    // give the loser a few retries
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(root.connected_children(), vec!["dup".to_string()]);
    assert_eq!(root.table().route_count("dup", "dup"), 1);
    assert!(first.is_parent_connected() ^ second.is_parent_connected());

    for node in [first, second, root] {
        node.shutdown().await;
    }
}

// ── Startup ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_root_without_store_refuses_to_start() {
    let result = ClusterNode::start(config("root", None), HandlerRegistry::new(), None).await;
    assert!(matches!(result, Err(canopy_cluster::ClusterError::Config(_))));
}
