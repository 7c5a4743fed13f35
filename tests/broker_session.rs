//! In-process multi-rank session tests (SPEC_FULL.md §2/§8: "an in-process
//! multi-rank broker tree over tokio channels standing in for the overlay
//! transport").

use fluxbroker::config::{ClusterSize, Rank};
use fluxbroker::kvs::CommitName;
use fluxbroker::message::{Message, MessageKind, Topic};
use fluxbroker::overlay::{EndpointRef, Overlay, OverlayRegistry};
use fluxbroker::BrokerConfig;
use fluxbroker::BrokerNode;

fn rank_config(session: &str, rank: u32, size: u32, parent_uri: Option<String>) -> BrokerConfig {
    let mut cfg = BrokerConfig::development(session);
    cfg.rank = Rank::from(rank);
    cfg.size = ClusterSize::try_new(size).unwrap();
    cfg.parent_uri = parent_uri;
    cfg.child_uri = format!("inproc://{session}/rank-{rank}/child");
    cfg.event_uri = format!("inproc://{session}/rank-{rank}/event");
    cfg.run_dir = std::env::temp_dir().join(format!("{session}-{rank}"));
    cfg
}

fn topic(s: &str) -> Topic {
    Topic::try_new(s).unwrap()
}

/// Scenario A (spec.md §8): put on a leaf rank, commit, get on a different
/// leaf — the write crosses the tree to the root and the read sees it.
#[tokio::test]
async fn three_rank_put_commit_get() {
    let registry = OverlayRegistry::new();
    let root = BrokerNode::start(rank_config("three-rank", 0, 3, None), registry.clone())
        .await
        .unwrap();
    let root_child_uri = root.overlay().child_uri().unwrap();

    let child1 = BrokerNode::start(
        rank_config("three-rank", 1, 3, Some(root_child_uri.clone())),
        registry.clone(),
    )
    .await
    .unwrap();
    let child2 = BrokerNode::start(
        rank_config("three-rank", 2, 3, Some(root_child_uri)),
        registry,
    )
    .await
    .unwrap();

    tokio::spawn(root.clone().run());
    tokio::spawn(child1.clone().run());
    tokio::spawn(child2.clone().run());

    child1
        .router()
        .kvs()
        .put(vec![("shared".to_string(), Some(serde_json::json!("hello")))])
        .await
        .unwrap();
    child1
        .router()
        .kvs()
        .commit(CommitName::try_new("c1").unwrap())
        .await
        .unwrap();

    let got = child2.router().kvs().get(vec!["shared".to_string()]).await.unwrap();
    assert_eq!(got["shared"], serde_json::json!("hello"));
}

/// An external caller wired directly against the root's child endpoint (no
/// router of its own) round-trips a `kvs.put`/`kvs.get` request exactly the
/// way a real ROUTER-socket client would (spec.md §4.1 wire framing).
#[tokio::test]
async fn raw_client_round_trips_kvs_over_the_wire() {
    let registry = OverlayRegistry::new();
    let root = BrokerNode::start(rank_config("raw-client", 0, 1, None), registry.clone())
        .await
        .unwrap();
    let root_child_uri = root.overlay().child_uri().unwrap();
    tokio::spawn(root.clone().run());

    let client = Overlay::new(registry);
    client.connect_parent(&root_child_uri).await.unwrap();
    let mut reply_rx = client.take_upstream_rx().await.unwrap();

    let put = Message::request(topic("kvs.put"), Some(serde_json::json!({"x": 42})));
    client.send(&EndpointRef::Parent, put).unwrap();
    let put_reply = reply_rx.recv().await.unwrap();
    assert_eq!(put_reply.kind(), MessageKind::Response);

    let commit = Message::request(
        topic("kvs.commit"),
        Some(serde_json::json!({"name": "raw-commit"})),
    );
    client.send(&EndpointRef::Parent, commit).unwrap();
    reply_rx.recv().await.unwrap();

    let get = Message::request(topic("kvs.get"), Some(serde_json::json!({"x": null})));
    client.send(&EndpointRef::Parent, get).unwrap();
    let get_reply = reply_rx.recv().await.unwrap();
    assert_eq!(get_reply.payload().unwrap()["x"], serde_json::json!(42));
}

/// Scenario E (spec.md §8): `broker.rank_forward` issued against one leaf
/// rank reaches its right sibling and dispatches a local `kvs.*` op there.
#[tokio::test]
async fn rank_forward_reaches_right_sibling() {
    let registry = OverlayRegistry::new();
    let root = BrokerNode::start(rank_config("rank-forward", 0, 3, None), registry.clone())
        .await
        .unwrap();
    let root_child_uri = root.overlay().child_uri().unwrap();

    let child1 = BrokerNode::start(
        rank_config("rank-forward", 1, 3, Some(root_child_uri.clone())),
        registry.clone(),
    )
    .await
    .unwrap();
    let child1_child_uri = child1.overlay().child_uri().unwrap();

    let child2 = BrokerNode::start(
        rank_config("rank-forward", 2, 3, Some(root_child_uri)),
        registry.clone(),
    )
    .await
    .unwrap();
    let child2_child_uri = child2.overlay().child_uri().unwrap();

    child1.overlay().connect_right(&child2_child_uri).await.unwrap();

    tokio::spawn(root.clone().run());
    tokio::spawn(child1.clone().run());
    tokio::spawn(child2.clone().run());

    child2
        .router()
        .kvs()
        .put(vec![(
            "forwarded".to_string(),
            Some(serde_json::json!("via-rank-forward")),
        )])
        .await
        .unwrap();
    child2
        .router()
        .kvs()
        .commit(CommitName::try_new("c2").unwrap())
        .await
        .unwrap();

    let client = Overlay::new(registry);
    client.connect_parent(&child1_child_uri).await.unwrap();
    let mut reply_rx = client.take_upstream_rx().await.unwrap();

    let forward = Message::request(
        topic("broker.rank_forward"),
        Some(serde_json::json!({
            "target_rank": 2,
            "inner_topic": "kvs.get",
            "inner_payload": {"forwarded": null},
        })),
    );
    client.send(&EndpointRef::Parent, forward).unwrap();
    let reply = reply_rx.recv().await.unwrap();
    assert_eq!(
        reply.payload().unwrap()["forwarded"],
        serde_json::json!("via-rank-forward")
    );
}
