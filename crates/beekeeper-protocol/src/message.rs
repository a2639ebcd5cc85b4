//! Wire message type and its metadata enums.
//!
//! A `Message` is the single unit of node-to-node communication. The
//! operation and status enums travel as their ordinals so older peers keep
//! decoding newer frames; the JSON payload is field-tagged for the same
//! reason.

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Intent of a `Message` towards the remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum Operation {
    #[default]
    None,
    /// Ask a node for a status report.
    Status,
    /// Transfer a job binary via the data field.
    JobTransfer,
    /// Transfer failed; data carries the details.
    TransferFailed,
    /// Transfer was successful.
    TransferAcknowledge,
    /// Run the local job against the task in the data field.
    JobExecute,
    /// A job ran; data carries the encoded result.
    JobResult,
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Operation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Operation::None),
            1 => Ok(Operation::Status),
            2 => Ok(Operation::JobTransfer),
            3 => Ok(Operation::TransferFailed),
            4 => Ok(Operation::TransferAcknowledge),
            5 => Ok(Operation::JobExecute),
            6 => Ok(Operation::JobResult),
            other => Err(format!("unknown operation ordinal: {other}")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::None => "None",
            Operation::Status => "Status",
            Operation::JobTransfer => "JobTransfer",
            Operation::TransferFailed => "TransferFailed",
            Operation::TransferAcknowledge => "TransferAcknowledge",
            Operation::JobExecute => "JobExecute",
            Operation::JobResult => "JobResult",
        };
        f.write_str(s)
    }
}

/// What a node is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    #[default]
    Idle,
    Working,
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Idle),
            1 => Ok(Status::Working),
            other => Err(format!("unknown status ordinal: {other}")),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => f.write_str("Idle"),
            Status::Working => f.write_str("Working"),
        }
    }
}

/// Metadata about a sender's host system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    /// CPU usage fraction, 0 (idle) to 1 (saturated).
    #[serde(default)]
    pub usage: f32,
    /// CPU die temperature in degrees Celsius. Some hosts report 0.
    #[serde(default)]
    pub cpu_temp: f32,
    /// Operating-system tag of the host.
    #[serde(default)]
    pub os: String,
}

/// Unit of node communication. Carries the payload for the operation plus
/// metadata about the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Message {
    /// Millisecond timestamp stamped by the sender just before the write.
    #[serde(default)]
    pub sent_at_ms: u64,

    /// Sender's configured name.
    #[serde(default)]
    pub name: String,

    /// Operation the remote node is asked to execute.
    #[serde(default)]
    pub operation: Operation,

    /// Opaque payload for the operation. Base64 on the wire.
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,

    /// Shared-secret token. Frames with a mismatched token are dropped.
    #[serde(default)]
    pub token: String,

    /// Inbound port the sender wants responses dialled to.
    #[serde(default)]
    pub respond_on_port: u16,

    /// Sender's current status.
    #[serde(default)]
    pub status: Status,

    /// Sender host metadata.
    #[serde(default)]
    pub node_info: NodeInfo,

    /// Sender address. Never read from the wire: the receiver stamps it
    /// from the transport layer.
    #[serde(skip)]
    pub addr: Option<IpAddr>,
}

impl Message {
    /// A message carrying only an operation tag.
    pub fn with_operation(operation: Operation) -> Self {
        Message {
            operation,
            ..Message::default()
        }
    }

    /// A message carrying an operation and a payload.
    pub fn with_data(operation: Operation, data: Vec<u8>) -> Self {
        Message {
            operation,
            data,
            ..Message::default()
        }
    }

    /// Stamp the send-time metadata.
    pub fn sent_now(&mut self) {
        self.sent_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
    }

    /// One-line summary for debug logging.
    pub fn summary(&self) -> String {
        let addr = self
            .addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".into());
        format!(
            "[sender: {} ({}), operation: {}, data: {} bytes]",
            addr,
            self.name,
            self.operation,
            self.data.len()
        )
    }
}

/// Serialize `Vec<u8>` as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
