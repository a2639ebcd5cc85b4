//! Discovery, authentication and liveness across the fabric.

use std::time::{Duration, Instant};

use beekeeper_core::{Error, MemoryNetwork, Node};

use crate::harness;

#[tokio::test]
async fn test_scan_finds_a_single_worker() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let nodes = primary.server.scan(Duration::from_secs(1)).await.unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].addr, worker.ip);
    assert_eq!(nodes[0].name, "w1");
    assert_eq!(nodes[0].info.os, "linux");
}

#[tokio::test]
async fn test_scan_collects_multiple_workers() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;
    harness::spawn_node(&net, "192.168.1.11", "w2", "windows").await;
    harness::spawn_node(&net, "192.168.1.12", "w3", "darwin").await;

    let nodes = primary.server.scan(Duration::from_secs(1)).await.unwrap();

    assert_eq!(nodes.len(), 3);
    let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["w1", "w2", "w3"]); // snapshot is address-ordered
}

#[tokio::test]
async fn test_scan_ignores_peers_with_a_different_token() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    harness::spawn_node_with_token(&net, "192.168.1.10", "intruder", "linux", "other-hive").await;

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();
    assert!(nodes.is_empty());
}

#[tokio::test]
async fn test_scan_with_no_peers_returns_empty_after_the_window() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;

    let started = Instant::now();
    let nodes = primary.server.scan(Duration::from_millis(200)).await.unwrap();

    assert!(nodes.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_connect_returns_the_identified_node() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let node = primary
        .server
        .connect(worker.ip, Some(Duration::from_secs(2)))
        .await
        .unwrap();

    assert_eq!(node.addr, worker.ip);
    assert_eq!(node.name, "w1");
}

#[tokio::test]
async fn test_transfer_wait_fails_when_the_node_stays_gone() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;

    // Never seen in the registry: the disconnection watchdog counts it out
    let ghost = Node::new("192.168.1.50".parse().unwrap());

    let started = Instant::now();
    let outcome = primary.server.await_transfer(&ghost, None).await;

    assert!(matches!(outcome, Err(Error::NodeDisconnected)));
    // Two watchdog periods at 50 ms each
    assert!(started.elapsed() >= Duration::from_millis(100));
}
