//! Job distribution: build once per target OS, ship to every node.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::task::JoinSet;

use beekeeper_protocol::{Message, Operation};

use crate::registry::{operating_systems, Node};
use crate::server::Server;
use crate::{Error, Result};

/// Name of the generated wrapper source in the build scratch directory.
const TEMP_SOURCE: &str = "temp.go";

/// Prefix of the per-OS binaries in the build scratch directory.
const TEMP_BINARY_PREFIX: &str = "temp_";

/// Contract with the external build tool: given a package, a function in
/// it, and the target operating systems, produce one executable per OS.
/// The core never looks inside the build; it only reads the outputs.
#[async_trait]
pub trait JobBuilder: Send + Sync {
    async fn build(
        &self,
        package: &str,
        function: &str,
        os_targets: &[String],
    ) -> Result<HashMap<String, PathBuf>>;
}

impl Server {
    /// Build a job and ship a copy to every node, waiting for each one to
    /// acknowledge. Fails fast on an empty node set, on the first typed
    /// transfer failure, or when a node drops off mid-transfer.
    pub async fn distribute_job(
        &self,
        builder: &dyn JobBuilder,
        package: &str,
        function: &str,
        nodes: &[Node],
    ) -> Result<()> {
        if nodes.is_empty() {
            return Err(Error::NoNodes);
        }

        let systems = operating_systems(nodes);
        let paths = builder.build(package, function, &systems).await?;

        let _watchdog = self
            .config()
            .connection_watchdog
            .then(|| self.spawn_connection_watchdog());

        let mut binaries: HashMap<String, Vec<u8>> = HashMap::new();
        for os in &systems {
            let path = paths
                .get(os)
                .ok_or_else(|| Error::BuildFailure(format!("no binary built for os {os}")))?;
            let data = tokio::fs::read(path).await.map_err(|e| {
                Error::BuildFailure(format!("unable to load binary for os {os}: {e}"))
            })?;
            binaries.insert(os.clone(), data);
        }

        let mut transfers = JoinSet::new();
        for node in nodes {
            let data = binaries
                .get(&node.info.os)
                .cloned()
                .ok_or_else(|| Error::BuildFailure(format!("no binary for os {}", node.info.os)))?;

            let server = self.clone();
            let mut node = node.clone();
            transfers.spawn(async move {
                let name = node.name.clone();
                server
                    .send_to_node(&mut node, Message::with_data(Operation::JobTransfer, data))
                    .await
                    .inspect_err(|e| {
                        tracing::warn!(node = %name, "unable to send job: {e}");
                    })?;
                server.await_transfer(&node, None).await.inspect_err(|e| {
                    tracing::warn!(node = %name, "transfer not acknowledged: {e}");
                })
            });
        }

        while let Some(joined) = transfers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Transport(format!("transfer task failed: {e}"))),
            }
        }

        if self.config().cleanup {
            if let Err(e) = cleanup_build(&self.config().scratch_dir).await {
                tracing::warn!("unable to perform cleanup: {e}");
            }
        }

        Ok(())
    }
}

/// Remove the generated wrapper source and every per-OS binary from the
/// build scratch directory.
pub(crate) async fn cleanup_build(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let temp_source = dir.join(TEMP_SOURCE);
    if temp_source.exists() {
        tokio::fs::remove_file(&temp_source).await?;
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(TEMP_BINARY_PREFIX)
        {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }

    Ok(())
}
