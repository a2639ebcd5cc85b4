//! Task execution: dispatcher side and the worker's job subprocess.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::task::JoinSet;

use beekeeper_protocol::codec::{encode_pipe_frame, read_pipe_frame};
use beekeeper_protocol::{Message, Operation, Task, TaskResult};

use crate::flake;
use crate::registry::Node;
use crate::server::Server;
use crate::{Error, Result};

/// Name of the transferred job binary inside the scratch directory.
pub(crate) const JOB_FILE: &str = "job.bin";

impl Server {
    /// Run a task on a node and block until its result comes back. Fails
    /// on timeout or when the worker reports an error in the result.
    pub async fn execute(
        &self,
        node: &Node,
        task: Task,
        timeout: Option<Duration>,
    ) -> Result<TaskResult> {
        let _watchdog = self
            .config()
            .connection_watchdog
            .then(|| self.spawn_connection_watchdog());

        let mut task = task;
        task.uuid = flake::next_uuid();
        let data = task.encode()?;

        let mut node = node.clone();
        self.send_to_node(&mut node, Message::with_data(Operation::JobExecute, data))
            .await?;

        let result = self.await_task(&task.uuid, timeout).await?;
        if !result.error.is_empty() {
            return Err(Error::TaskFailed(result.error));
        }

        Ok(result)
    }

    /// Run the same task on every node concurrently. Returns all results,
    /// or the first failure.
    pub async fn execute_on_all(
        &self,
        nodes: &[Node],
        task: Task,
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskResult>> {
        let mut executions = JoinSet::new();
        for node in nodes {
            let server = self.clone();
            let node = node.clone();
            let task = task.clone();
            executions.spawn(async move {
                server.execute(&node, task, timeout).await.inspect_err(|e| {
                    tracing::warn!(node = %node.name, "task failed: {e}");
                })
            });
        }

        let mut results = Vec::with_capacity(nodes.len());
        while let Some(joined) = executions.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Transport(format!("execute task failed: {e}"))),
            }
        }

        Ok(results)
    }

    /// Worker side: spawn the transferred job binary, feed it the task on
    /// stdin and read its framed result from stdout. The pipe speaks the
    /// same header as the socket but an uncompressed payload.
    pub(crate) async fn run_local_job(&self, task: &Task) -> Result<TaskResult> {
        let data = task.encode()?;
        let path = self.config().scratch_dir.join(JOB_FILE);

        let mut child = tokio::process::Command::new(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Io(std::io::Error::other(format!("unable to start job process: {e}"))))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("unable to get stdin pipe")))?;
        stdin.write_all(&encode_pipe_frame(&data)).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("unable to get stdout pipe")))?;
        let mut reader = BufReader::new(stdout);
        let payload = read_pipe_frame(&mut reader, self.config().max_frame_size).await?;

        let mut result = TaskResult::decode(&payload)?;
        result.uuid = task.uuid.clone();

        let _ = child.wait().await;

        Ok(result)
    }
}
