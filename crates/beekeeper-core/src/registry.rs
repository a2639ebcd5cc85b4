//! Node registry -- the set of peers this server has heard from.
//!
//! Keyed by IP: two nodes are the same node iff their addresses are equal.
//! Entries appear on the first authenticated frame from an address and are
//! replaced wholesale on later frames; nothing removes a single entry (the
//! connection watchdog clears the whole set periodically).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use beekeeper_protocol::{Message, NodeInfo, Status};

use crate::transport::Connection;

/// A known peer.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: IpAddr,
    pub name: String,
    pub status: Status,
    pub info: NodeInfo,
    /// Cached connection, filled in on first send from this handle.
    pub(crate) conn: Option<Connection>,
}

impl Node {
    pub fn new(addr: IpAddr) -> Self {
        Node {
            addr,
            name: String::new(),
            status: Status::Idle,
            info: NodeInfo::default(),
            conn: None,
        }
    }

    /// Build a node from a received message's metadata. Requires the
    /// transport-stamped sender address.
    pub fn from_message(msg: &Message) -> Option<Self> {
        Some(Node {
            addr: msg.addr?,
            name: msg.name.clone(),
            status: msg.status,
            info: msg.node_info.clone(),
            conn: None,
        })
    }
}

// Node identity is its address
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Node {}

/// Thread-safe registry of known peers, keyed by IP.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<HashMap<IpAddr, Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry::default()
    }

    /// Insert or replace the entry for the node's IP. A replacement without
    /// a connection keeps the one already cached for that peer.
    pub async fn merge(&self, mut node: Node) {
        let mut nodes = self.inner.write().await;
        if node.conn.is_none() {
            if let Some(existing) = nodes.get(&node.addr) {
                node.conn = existing.conn.clone();
            }
        }
        nodes.insert(node.addr, node);
    }

    /// Drop every entry. Peers reappear when they next speak.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn find(&self, addr: IpAddr) -> Option<Node> {
        self.inner.read().await.get(&addr).cloned()
    }

    pub async fn contains(&self, addr: IpAddr) -> bool {
        self.inner.read().await.contains_key(&addr)
    }

    /// Current entries, ordered by address for stable output.
    pub async fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.inner.read().await.values().cloned().collect();
        nodes.sort_by_key(|n| n.addr);
        nodes
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// The distinct operating-system tags present in a node set, in first-seen
/// order.
pub fn operating_systems(nodes: &[Node]) -> Vec<String> {
    let mut systems: Vec<String> = Vec::new();
    for node in nodes {
        if !systems.contains(&node.info.os) {
            systems.push(node.info.os.clone());
        }
    }
    systems
}

/// Render a node set as a table of name, address and status.
pub fn render_table(nodes: &[Node]) -> String {
    let mut table = comfy_table::Table::new();
    table.set_header(vec!["Name", "Address", "Status", "OS"]);
    for node in nodes {
        table.add_row(vec![
            node.name.clone(),
            node.addr.to_string(),
            node.status.to_string(),
            node.info.os.clone(),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beekeeper_protocol::Operation;

    fn node(addr: &str, name: &str, os: &str) -> Node {
        Node {
            addr: addr.parse().unwrap(),
            name: name.into(),
            status: Status::Idle,
            info: NodeInfo {
                usage: 0.0,
                cpu_temp: 0.0,
                os: os.into(),
            },
            conn: None,
        }
    }

    #[tokio::test]
    async fn test_one_entry_per_ip() {
        let registry = NodeRegistry::new();
        registry.merge(node("192.168.1.10", "w1", "linux")).await;
        registry.merge(node("192.168.1.10", "w1-renamed", "linux")).await;
        registry.merge(node("192.168.1.11", "w2", "darwin")).await;

        assert_eq!(registry.len().await, 2);
        // Latest merge wins for the shared IP
        let found = registry.find("192.168.1.10".parse().unwrap()).await.unwrap();
        assert_eq!(found.name, "w1-renamed");
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let registry = NodeRegistry::new();
        registry.merge(node("192.168.1.10", "w1", "linux")).await;
        let first = registry.snapshot().await;
        registry.merge(node("192.168.1.10", "w1", "linux")).await;
        let second = registry.snapshot().await;

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].name, second[0].name);
    }

    #[tokio::test]
    async fn test_clear_empties_registry() {
        let registry = NodeRegistry::new();
        registry.merge(node("192.168.1.10", "w1", "linux")).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_equality_is_by_ip() {
        let a = node("192.168.1.10", "alpha", "linux");
        let b = node("192.168.1.10", "beta", "windows");
        let c = node("192.168.1.11", "alpha", "linux");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_message_requires_transport_address() {
        let mut msg = Message::with_operation(Operation::Status);
        msg.name = "w1".into();
        assert!(Node::from_message(&msg).is_none());

        msg.addr = Some("192.168.1.10".parse().unwrap());
        let node = Node::from_message(&msg).unwrap();
        assert_eq!(node.addr, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(node.name, "w1");
    }

    #[test]
    fn test_operating_systems_dedup() {
        let nodes = vec![
            node("192.168.1.1", "a", "linux"),
            node("192.168.1.2", "b", "windows"),
            node("192.168.1.3", "c", "linux"),
        ];
        assert_eq!(operating_systems(&nodes), vec!["linux", "windows"]);
    }

    #[test]
    fn test_render_table_lists_every_node() {
        let nodes = vec![
            node("192.168.1.1", "a", "linux"),
            node("192.168.1.2", "b", "windows"),
        ];
        let table = render_table(&nodes);
        assert!(table.contains("192.168.1.1"));
        assert!(table.contains("b"));
        assert!(table.contains("Idle"));
    }
}
