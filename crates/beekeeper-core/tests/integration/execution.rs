//! Task execution: dispatch, subprocess round-trip, timeouts, balancing.

use std::time::{Duration, Instant};

use beekeeper_core::{Error, LoadBalancer, MemoryNetwork, Node, Task};

use crate::harness;

#[cfg(unix)]
fn install_job(node: &harness::TestNode, returns_json: &str) {
    use std::os::unix::fs::PermissionsExt;

    // A job that ignores its input and prints a fixed framed result
    let result_json = format!(
        r#"{{"uuid":"","task":{{"uuid":"","arguments":{{}},"returns":{returns_json},"error":""}},"error":""}}"#
    );
    let script = format!(
        "#!/bin/sh\nread -r _len\njson='{result_json}'\nprintf '%s\\n%s' \"${{#json}}\" \"$json\"\n"
    );

    let path = node.scratch_path().join("job.bin");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_execute_returns_the_job_result() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;
    install_job(&worker, r#"{"x":1}"#);

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();
    assert_eq!(nodes.len(), 1);

    let result = primary
        .server
        .execute(&nodes[0], Task::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(!result.uuid.is_empty());
    assert!(result.error.is_empty());
    assert_eq!(result.task.returns.get("x"), Some(&serde_json::json!(1)));
}

#[tokio::test]
async fn test_execute_times_out_when_the_worker_never_replies() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    harness::spawn_mute_peer(&net, "192.168.1.10").await;

    let node = Node::new("192.168.1.10".parse().unwrap());
    let started = Instant::now();
    let outcome = primary
        .server
        .execute(&node, Task::new(), Some(Duration::from_millis(100)))
        .await;

    assert!(matches!(outcome, Err(Error::Timeout)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "timeout took {elapsed:?}");
}

#[tokio::test]
async fn test_worker_reports_a_missing_job_instead_of_going_silent() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let _worker = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();

    // No job was ever transferred; the worker still answers, with an error
    let outcome = primary
        .server
        .execute(&nodes[0], Task::new(), Some(Duration::from_secs(5)))
        .await;

    match outcome {
        Err(Error::TaskFailed(text)) => {
            assert!(text.contains("unable to run job"), "text was: {text}")
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_balancer_runs_tasks_across_workers() {
    let net = MemoryNetwork::new();
    let primary = harness::spawn_node(&net, "192.168.1.1", "queen", "linux").await;
    let w1 = harness::spawn_node(&net, "192.168.1.10", "w1", "linux").await;
    let w2 = harness::spawn_node(&net, "192.168.1.11", "w2", "linux").await;
    install_job(&w1, r#"{"x":1}"#);
    install_job(&w2, r#"{"x":1}"#);

    let nodes = primary.server.scan(Duration::from_millis(300)).await.unwrap();
    assert_eq!(nodes.len(), 2);

    let balancer = LoadBalancer::new(primary.server.clone(), nodes);
    for _ in 0..4 {
        let result = balancer
            .execute(Task::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.task.returns.get("x"), Some(&serde_json::json!(1)));
    }
}
