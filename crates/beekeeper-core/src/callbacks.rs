//! Per-operation handler table and the host probe behind Status replies.

use async_trait::async_trait;

use beekeeper_protocol::{Message, NodeInfo, Operation, Status, Task, TaskResult};

use crate::server::Server;
use crate::transport::Request;

/// Samples the local host for a Status reply.
///
/// The default implementation measures CPU usage over a one-second window.
/// Temperature readings are deeply platform-specific, so the default
/// reports 0; embedders with a working sensor path provide their own probe.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn sample(&self) -> NodeInfo;
}

/// sysinfo-backed probe.
pub struct SysinfoProbe;

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn sample(&self) -> NodeInfo {
        let usage = tokio::task::spawn_blocking(|| {
            let mut sys = sysinfo::System::new();
            sys.refresh_cpu_usage();
            std::thread::sleep(std::time::Duration::from_secs(1));
            sys.refresh_cpu_usage();
            sys.global_cpu_usage() / 100.0
        })
        .await
        .unwrap_or(0.0);

        NodeInfo {
            usage,
            cpu_temp: 0.0,
            os: std::env::consts::OS.into(),
        }
    }
}

/// Fixed probe for tests and embedders that know their numbers.
pub struct StaticProbe {
    info: NodeInfo,
}

impl StaticProbe {
    pub fn new(os: &str) -> Self {
        StaticProbe {
            info: NodeInfo {
                usage: 0.0,
                cpu_temp: 0.0,
                os: os.into(),
            },
        }
    }

    pub fn with_info(info: NodeInfo) -> Self {
        StaticProbe { info }
    }
}

#[async_trait]
impl SystemProbe for StaticProbe {
    async fn sample(&self) -> NodeInfo {
        self.info.clone()
    }
}

/// Route one authenticated request to its operation handler. The registry
/// merge and the awaitable-list walk already ran in the server loop.
pub(crate) async fn dispatch(server: Server, request: Request) {
    match request.message.operation {
        Operation::Status => status_callback(server, request).await,
        Operation::JobTransfer => job_transfer_callback(server, request).await,
        Operation::JobExecute => job_execute_callback(server, request).await,
        // Correlation frames and bare status carriers: no direct reply,
        // the server loop already fed them to the awaitable layer
        Operation::JobResult
        | Operation::TransferAcknowledge
        | Operation::TransferFailed
        | Operation::None => {}
    }
}

async fn status_callback(server: Server, request: Request) {
    let info = server.probe().sample().await;

    let mut reply = Message::with_operation(Operation::None);
    reply.node_info = info;

    if let Err(e) = server.send_to_conn(&request.conn, reply).await {
        tracing::warn!("error while responding to status request: {e}");
    }
}

async fn job_transfer_callback(server: Server, request: Request) {
    tracing::info!(from = %request.message.name, "transferring new job");

    match save_job(&server, &request.message.data).await {
        Ok(()) => {
            let ack = Message::with_operation(Operation::TransferAcknowledge);
            if let Err(e) = server.send_to_conn(&request.conn, ack).await {
                tracing::warn!("error while acknowledging transfer: {e}");
                return;
            }
            tracing::info!("new job transferred successfully");
        }
        Err(text) => {
            tracing::warn!("unable to save job: {text}");
            let reply = Message::with_data(Operation::TransferFailed, text.into_bytes());
            if let Err(e) = server.send_to_conn(&request.conn, reply).await {
                tracing::warn!("error while reporting transfer error: {e}");
            }
        }
    }
}

/// Write the transferred binary into the scratch directory. The error
/// string travels back to the dispatcher verbatim.
async fn save_job(server: &Server, data: &[u8]) -> std::result::Result<(), String> {
    let dir = server.config().scratch_dir.clone();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| format!("unable to create beekeeper folder: {e}"))?;

    if data.is_empty() {
        return Err("empty data field".into());
    }

    let path = dir.join(crate::execute::JOB_FILE);
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| format!("unable to save job data: {e}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| format!("unable to set job permissions: {e}"))?;
    }

    Ok(())
}

async fn job_execute_callback(server: Server, request: Request) {
    let task = match Task::decode(&request.message.data) {
        Ok(task) => task,
        Err(e) => {
            tracing::warn!("unable to read task data: {e}");
            return;
        }
    };

    tracing::info!(task = %task.uuid, from = %request.message.name, "executing task");
    server.set_status(Status::Working).await;

    // Whatever happens locally, the dispatcher's wait must resolve
    let result = match server.run_local_job(&task).await {
        Ok(result) => result,
        Err(e) => {
            let text = format!("unable to run job: {e}");
            tracing::warn!("{text}");
            TaskResult {
                uuid: task.uuid.clone(),
                task: Task::default(),
                error: text,
            }
        }
    };

    server.set_status(Status::Idle).await;

    let data = match result.encode() {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("unable to encode task result: {e}");
            return;
        }
    };

    if let Err(e) = server
        .send_to_conn(&request.conn, Message::with_data(Operation::JobResult, data))
        .await
    {
        tracing::warn!("error while sending task result: {e}");
    }
}
