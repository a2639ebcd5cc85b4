//! Test harness: spawn in-process nodes on a shared memory fabric.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use beekeeper_core::callbacks::StaticProbe;
use beekeeper_core::{Config, MemoryNetwork, Server, Transport};

pub const TOKEN: &str = "T";

/// A running in-process node. The scratch dir doubles as the node's
/// `.beekeeper` directory and is removed with the handle.
pub struct TestNode {
    pub server: Server,
    pub ip: IpAddr,
    pub scratch: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub fn scratch_path(&self) -> &std::path::Path {
        self.scratch.path()
    }

    pub async fn shutdown(&self) {
        self.server.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Spawn a node with the shared test token.
pub async fn spawn_node(net: &MemoryNetwork, ip: &str, name: &str, os: &str) -> TestNode {
    spawn_node_with_token(net, ip, name, os, TOKEN).await
}

/// Spawn a node with an explicit token. Watchdogs are tightened to test
/// speed and the connection watchdog is off so registries stay stable
/// unless a test clears them itself.
pub async fn spawn_node_with_token(
    net: &MemoryNetwork,
    ip: &str,
    name: &str,
    os: &str,
    token: &str,
) -> TestNode {
    init_logging();

    let scratch = tempfile::tempdir().expect("scratch dir");
    let config = Config {
        name: name.into(),
        token: token.into(),
        connection_watchdog: false,
        watchdog_sleep_ms: 50,
        scan_window_ms: 200,
        scratch_dir: scratch.path().to_path_buf(),
        ..Config::default()
    };

    let ip: IpAddr = ip.parse().expect("node ip");
    let server = Server::with_transport(
        config,
        Arc::new(net.transport(ip)),
        Arc::new(StaticProbe::new(os)),
    );

    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.start().await;
    });
    // Give the listener a beat to register on the fabric
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestNode {
        server,
        ip,
        scratch,
    }
}

/// Honour RUST_LOG when debugging a failing scenario.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Register a peer that accepts frames and never answers them.
#[allow(dead_code)]
pub async fn spawn_mute_peer(net: &MemoryNetwork, ip: &str) {
    let transport = net.transport(ip.parse().expect("peer ip"));
    let (queue_tx, mut queue_rx) = mpsc::channel(64);
    let (shutdown, _) = broadcast::channel(1);

    transport
        .listen(&Config::default(), queue_tx, shutdown)
        .await
        .expect("mute peer listen");

    tokio::spawn(async move { while queue_rx.recv().await.is_some() {} });
}
