//! Beekeeper Core -- cluster-computing fabric for a LAN of trusted hosts.
//!
//! A primary node discovers workers on the local subnet, ships them a
//! compiled job binary, then dispatches tasks and collects results over
//! long-lived encrypted connections. All state is per-`Server`; tests
//! construct servers over an in-memory transport.

mod awaitable;
pub mod balancer;
mod broadcast;
pub mod callbacks;
pub mod config;
pub mod distribute;
mod execute;
pub mod error;
mod flake;
pub mod registry;
pub mod server;
pub mod transport;
mod watchdog;

pub use balancer::LoadBalancer;
pub use config::Config;
pub use distribute::JobBuilder;
pub use error::{Error, Result};
pub use registry::{operating_systems, render_table, Node, NodeRegistry};
pub use server::Server;
pub use transport::{Connection, MemoryNetwork, MemoryTransport, Request, TlsTransport, Transport};

pub use beekeeper_protocol::{Message, NodeInfo, Operation, Status, Task, TaskResult};
