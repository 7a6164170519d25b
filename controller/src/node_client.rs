//! Controller -> agent control-protocol client (spec §6.2), plus the node
//! set itself (§4.10 "CRUD on the node set"). Fan-out to every node runs
//! concurrently off one pooled `reqwest::Client`, matching §5's "one
//! outbound HTTP client shared across fan-out."
//!
//! Per-node last-successful-contact is recorded opportunistically on every
//! call rather than polled separately (SPEC_FULL supplemented feature:
//! per-node health surface for the admin facade).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub control_addr: String,
}

struct NodeState {
    descriptor: NodeDescriptor,
    last_success: AtomicI64,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeStatus {
    pub reachable: bool,
    pub seconds_since_success: Option<i64>,
}

pub struct NodeSet {
    client: reqwest::Client,
    shared_secret: String,
    nodes: DashMap<String, NodeState>,
    started_at: Instant,
}

impl NodeSet {
    pub fn new(shared_secret: String, initial: Vec<NodeDescriptor>) -> NodeSet {
        let set = NodeSet {
            client: reqwest::Client::new(),
            shared_secret,
            nodes: DashMap::new(),
            started_at: Instant::now(),
        };
        for descriptor in initial {
            set.upsert(descriptor);
        }
        set
    }

    pub fn upsert(&self, descriptor: NodeDescriptor) {
        self.nodes.insert(
            descriptor.name.clone(),
            NodeState {
                descriptor,
                last_success: AtomicI64::new(-1),
            },
        );
    }

    pub fn remove(&self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn list(&self) -> Vec<NodeDescriptor> {
        self.nodes.iter().map(|kv| kv.value().descriptor.clone()).collect()
    }

    pub fn status_of(&self, name: &str) -> Option<NodeStatus> {
        self.nodes.get(name).map(|entry| self.status_from_state(&entry))
    }

    pub fn statuses(&self) -> Vec<(String, NodeStatus)> {
        self.nodes
            .iter()
            .map(|kv| (kv.key().clone(), self.status_from_state(kv.value())))
            .collect()
    }

    fn status_from_state(&self, state: &NodeState) -> NodeStatus {
        let last = state.last_success.load(Ordering::Relaxed);
        if last < 0 {
            NodeStatus { reachable: false, seconds_since_success: None }
        } else {
            let elapsed = self.started_at.elapsed().as_secs() as i64 - last;
            NodeStatus { reachable: elapsed < 120, seconds_since_success: Some(elapsed) }
        }
    }

    fn mark_success(&self, name: &str) {
        if let Some(entry) = self.nodes.get(name) {
            let now = self.started_at.elapsed().as_secs() as i64;
            entry.last_success.store(now, Ordering::Relaxed);
        }
    }

    /// Fans `block` out to every node concurrently; returns the count of
    /// nodes that acknowledged successfully. Losses are tolerated per
    /// spec §4.8 step 6 — the caller only needs the count.
    pub async fn fan_out_block(&self, ip: &str, port: Option<u16>, ttl: Duration, log: &slog::Logger) -> usize {
        let targets = self.list();
        let futures = targets.into_iter().map(|node| {
            let ip = ip.to_owned();
            async move {
                let ok = self.block_one(&node, &ip, port, ttl).await;
                if ok {
                    self.mark_success(&node.name);
                } else {
                    slog::warn!(log, "block fan-out failed"; "node" => &node.name, "ip" => &ip);
                }
                ok
            }
        });
        futures_util::future::join_all(futures).await.into_iter().filter(|ok| *ok).count()
    }

    async fn block_one(&self, node: &NodeDescriptor, ip: &str, port: Option<u16>, ttl: Duration) -> bool {
        let body = connlimit_protocol::BlockRequest {
            ip: ip.to_owned(),
            port,
            duration: ttl.as_secs(),
            secret: self.shared_secret.clone(),
        };
        let result = self
            .client
            .post(format!("http://{}/block", node.control_addr))
            .json(&body)
            .timeout(Duration::from_secs(3))
            .send()
            .await;
        matches!(result, Ok(resp) if resp.status().is_success())
    }
}
