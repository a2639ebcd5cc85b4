//! Job transfer: build, ship, acknowledge or fail.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use beekeeper_core::{Error, JobBuilder, MemoryNetwork, Result};

use crate::harness;

/// Builder double: writes fixed bytes per OS into a scratch dir and hands
/// the paths back, like the external build tool would.
struct StaticBuilder {
    dir: PathBuf,
    binaries: HashMap<String, Vec<u8>>,
}

impl StaticBuilder {
    fn single(dir: &std::path::Path, os: &str, data: &[u8]) -> Self {
        StaticBuilder {
            dir: dir.to_path_buf(),
            binaries: HashMap::from([(os.to_string(), data.to_vec())]),
        }
    }
}

#[async_trait]
impl JobBuilder for StaticBuilder {
    async fn build(
        &self,
        _package: &str,
        _function: &str,
        os_targets: &[String],
    ) -> Result<HashMap<String, PathBuf>> {
        let mut paths = HashMap::new();
        for os in os_targets {
            let data = self
                .binaries
                .get(os)
                .ok_or_else(|| Error::BuildFailure(format!("unsupported os {os}")))?;
            let path = self.dir.join(format!("temp_{os}"));
            std::fs::write(&path, data)
                .map_err(|e| Error::BuildFailure(format!("write {os} binary: {e}")))?;
            paths.insert(os.clone(), path);
        }
        Ok(paths)
    }
}

#[tokio::test]
async fn test_distribute_writes_the_job_and_gets_an_ack() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();
    assert_eq!(nodes.len(), 1);

    let build_dir = tempfile::tempdir().unwrap();
    let builder = StaticBuilder::single(build_dir.path(), "linux", b"test");

    primary
        .server
        .distribute_job(&builder, "pkg", "Fn", &nodes)
        .await
        .unwrap();

    let written = std::fs::read(worker.scratch_path().join("job.bin")).unwrap();
    assert_eq!(written, b"test");
}

#[tokio::test]
async fn test_distribute_surfaces_a_typed_worker_failure() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();

    // A zero-byte binary is refused on the worker side
    let build_dir = tempfile::tempdir().unwrap();
    let builder = StaticBuilder::single(build_dir.path(), "linux", b"");

    let outcome = primary
        .server
        .distribute_job(&builder, "pkg", "Fn", &nodes)
        .await;

    match outcome {
        Err(Error::TransferFailed(text)) => assert!(
            text.contains("empty data field"),
            "unexpected failure text: {text}"
        ),
        other => panic!("expected TransferFailed, got {other:?}"),
    }
    assert!(!worker.scratch_path().join("job.bin").exists());
}

#[tokio::test]
async fn test_distribute_aborts_when_the_builder_fails() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let _worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();

    // Builder double that only knows windows; linux targets fail the build
    let build_dir = tempfile::tempdir().unwrap();
    let builder = StaticBuilder::single(build_dir.path(), "windows", b"test");

    let outcome = primary
        .server
        .distribute_job(&builder, "pkg", "Fn", &nodes)
        .await;
    assert!(matches!(outcome, Err(Error::BuildFailure(_))));
}

#[tokio::test]
async fn test_distribute_cleans_the_build_scratch() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let _worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();

    // Build into the primary's own scratch dir so cleanup can find it
    let builder = StaticBuilder::single(primary.scratch_path(), "linux", b"test");

    primary
        .server
        .distribute_job(&builder, "pkg", "Fn", &nodes)
        .await
        .unwrap();

    assert!(!primary.scratch_path().join("temp_linux").exists());
}
