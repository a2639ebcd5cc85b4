//! Error kinds surfaced by the core runtime.

use beekeeper_protocol::ProtocolError;

/// Sentinel carried in a transfer failure when the worker sent no detail.
pub const NO_EXPLANATION: &str = "no further explanation received";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An awaitable expired before a matching message arrived.
    #[error("time exceeded")]
    Timeout,

    /// The disconnection watchdog tripped while waiting on a peer.
    #[error("node disconnected")]
    NodeDisconnected,

    /// A worker replied with a typed transfer-failure frame.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// A worker reported a task failure in its result.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The external build tool failed; distribution aborts.
    #[error("build failed: {0}")]
    BuildFailure(String),

    /// Distribution was asked to run against an empty node set.
    #[error("no nodes provided")]
    NoNodes,

    /// The server was stopped while an operation was in flight.
    #[error("terminated")]
    Terminated,

    /// Dial, listen or connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
