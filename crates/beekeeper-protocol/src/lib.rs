//! Beekeeper Protocol -- wire types, frame codec, TLS material.
//!
//! TLS over TCP between nodes. Each frame is an ASCII decimal byte length,
//! a newline, then that many bytes of gzip-compressed JSON.

pub mod codec;
pub mod message;
pub mod task;
pub mod tls;

pub use codec::FrameCodec;
pub use message::{Message, NodeInfo, Operation, Status};
pub use task::{Task, TaskResult};

/// Default inbound and outbound port for Beekeeper servers.
pub const DEFAULT_PORT: u16 = 2020;

/// Default wire limit for a single inbound frame: 1 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Default window during which a broadcast status probe collects replies.
pub const DEFAULT_SCAN_WINDOW: std::time::Duration = std::time::Duration::from_secs(2);

/// Default polling period of the connection-refresh and disconnection watchdogs.
pub const DEFAULT_WATCHDOG_SLEEP: std::time::Duration = std::time::Duration::from_secs(15);

/// Missed watchdog polls before a peer is declared disconnected.
pub const DEFAULT_MAX_DISCONNECTIONS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("frame decode error: {0}")]
    FrameDecode(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
