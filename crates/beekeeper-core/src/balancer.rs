//! Softmax load balancer over a fixed node set.
//!
//! Picks among the least-loaded nodes, weighting by observed latency so
//! the fastest node wins most often while slower ones still get explored.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;

use beekeeper_protocol::{Task, TaskResult};

use crate::registry::Node;
use crate::server::Server;
use crate::{Error, Result};

/// Latency assigned to a node before its first measurement.
const SEED_LATENCY_MS: u64 = 1_000;

/// Initial best latency, high enough that the first real measurement wins.
const SEED_BEST_MS: u64 = 3_600_000;

struct NodeRecord {
    node: Node,
    /// Tasks currently in flight on this node.
    load: u32,
    /// Last observed round-trip latency.
    latency_ms: u64,
}

struct BalancerState {
    records: Vec<NodeRecord>,
    /// Minimum latency seen across all records.
    best_ms: u64,
}

pub struct LoadBalancer {
    server: Server,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(server: Server, nodes: Vec<Node>) -> Self {
        let records = nodes
            .into_iter()
            .map(|node| NodeRecord {
                node,
                load: 0,
                latency_ms: SEED_LATENCY_MS,
            })
            .collect();

        LoadBalancer {
            server,
            state: Mutex::new(BalancerState {
                records,
                best_ms: SEED_BEST_MS,
            }),
        }
    }

    /// Run a task on the node the balancer deems best right now.
    pub async fn execute(&self, task: Task, timeout: Option<Duration>) -> Result<TaskResult> {
        let (index, node) = {
            let mut state = self.state.lock().await;
            if state.records.is_empty() {
                return Err(Error::NoNodes);
            }
            let index = pick(&state);
            state.records[index].load += 1;
            (index, state.records[index].node.clone())
        };

        let started = Instant::now();
        let outcome = self.server.execute(&node, task, timeout).await;

        {
            let mut state = self.state.lock().await;
            let record = &mut state.records[index];
            record.load = record.load.saturating_sub(1);
            if outcome.is_ok() {
                let elapsed = started.elapsed().as_millis().max(1) as u64;
                record.latency_ms = elapsed;
                if elapsed < state.best_ms {
                    state.best_ms = elapsed;
                }
            }
        }

        outcome
    }
}

/// Pick a record index: restrict to the least-loaded nodes, then sample a
/// softmax over their latency ratios by inverse CDF. The fastest candidate
/// carries the highest weight.
fn pick(state: &BalancerState) -> usize {
    let min_load = state
        .records
        .iter()
        .map(|r| r.load)
        .min()
        .expect("balancer has records");

    let candidates: Vec<usize> = state
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.load == min_load)
        .map(|(i, _)| i)
        .collect();

    let ratios: Vec<f64> = candidates
        .iter()
        .map(|&i| state.records[i].latency_ms as f64 / state.best_ms as f64)
        .collect();

    // Shift by the minimum ratio so the exponent never overflows
    let fastest = ratios.iter().cloned().fold(f64::INFINITY, f64::min);
    let weights: Vec<f64> = ratios.iter().map(|r| (fastest - r).exp()).collect();
    let total: f64 = weights.iter().sum();

    let mut draw = rand::thread_rng().gen::<f64>() * total;
    for (slot, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return candidates[slot];
        }
        draw -= weight;
    }

    *candidates.last().expect("candidate set is non-empty")
}
