//! C8: enforcement coordinator. Turns a `ViolationEvent` into side-effects on
//! the subscription API and on every node agent, serialized per-subscriber
//! per spec §4.8.
//!
//! Per-subscriber serialization is the sharded-worker shape named in design
//! note §9 ("Avoid a single global mutex around the whole enforcement
//! pipeline"): `subscriber_id` hashes into one of N lanes, each lane a single
//! task reading its own `mpsc` channel, so two violations for the same
//! subscriber always land on the same lane and are processed one at a time,
//! while unrelated subscribers proceed on other lanes concurrently. This is
//! the same "one task owns the state, callers dispatch through a channel"
//! pattern as the agent's firewall manager and the teacher's
//! `enforce_via_iptables`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::limit_cache::LimitCache;
use crate::node_client::NodeSet;
use crate::persist::BlockedSubscriberStore;
use crate::subscription_api::SubscriptionApiClient;
use crate::violation::ViolationEvent;

/// Narrow hook for side-notifications. The formatting and transport for any
/// particular channel (Telegram, e-mail, ...) is out of scope (spec §1); the
/// coordinator only needs something it can call without depending on a
/// concrete client.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subscriber: &str, reason: &str, nodes_reached: usize, nodes_total: usize);
}

/// Default sink: structured log line, no outbound call. A real deployment
/// wires a Telegram-backed `NotificationSink` in `main` instead.
pub struct LoggingNotificationSink {
    log: slog::Logger,
}

impl LoggingNotificationSink {
    pub fn new(log: slog::Logger) -> Self {
        LoggingNotificationSink { log }
    }
}

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(&self, subscriber: &str, reason: &str, nodes_reached: usize, nodes_total: usize) {
        slog::info!(self.log, "enforcement notification";
            "subscriber" => subscriber, "reason" => reason,
            "nodes_reached" => nodes_reached, "nodes_total" => nodes_total);
    }
}

#[derive(Debug, Clone)]
pub struct EnforcementConfig {
    pub drop_cooldown: Duration,
    pub disable_duration: Duration,
    pub drop_duration: Duration,
    pub drop_all_ips: bool,
    pub shards: usize,
}

/// Result of a manually-forced enforcement, surfaced back to the admin
/// facade (C10) rather than fire-and-forgotten like the event-driven path.
#[derive(Debug, Clone)]
pub struct EnforcementOutcome {
    pub disabled: bool,
    pub nodes_reached: usize,
    pub nodes_total: usize,
}

enum ShardMessage {
    Violation {
        event: ViolationEvent,
        force: bool,
        reply: Option<oneshot::Sender<EnforcementOutcome>>,
    },
    ReEnable {
        subscriber: String,
        reply: Option<oneshot::Sender<bool>>,
    },
}

struct Shared {
    api: SubscriptionApiClient,
    limits: Arc<LimitCache>,
    nodes: Arc<NodeSet>,
    blocked: DashMap<String, DateTime<Utc>>,
    cooldown: DashMap<String, Instant>,
    store: BlockedSubscriberStore,
    notifier: Arc<dyn NotificationSink>,
    cfg: EnforcementConfig,
    log: slog::Logger,
}

pub struct EnforcementCoordinator {
    shards: Vec<mpsc::Sender<ShardMessage>>,
    shared: Arc<Shared>,
}

impl EnforcementCoordinator {
    pub fn new(
        api: SubscriptionApiClient,
        limits: Arc<LimitCache>,
        nodes: Arc<NodeSet>,
        store: BlockedSubscriberStore,
        initial_blocked: HashMap<String, DateTime<Utc>>,
        notifier: Arc<dyn NotificationSink>,
        cfg: EnforcementConfig,
        log: slog::Logger,
    ) -> Arc<EnforcementCoordinator> {
        let blocked = DashMap::new();
        for (subscriber, expires_at) in initial_blocked {
            blocked.insert(subscriber, expires_at);
        }

        let shared = Arc::new(Shared {
            api,
            limits,
            nodes,
            blocked,
            cooldown: DashMap::new(),
            store,
            notifier,
            cfg: cfg.clone(),
            log,
        });

        let shard_count = cfg.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for lane in 0..shard_count {
            let (tx, rx) = mpsc::channel(128);
            tokio::task::spawn(run_shard(rx, Arc::clone(&shared)));
            shards.push(tx);
            let _ = lane;
        }

        Arc::new(EnforcementCoordinator { shards, shared })
    }

    fn shard_for(&self, subscriber: &str) -> &mpsc::Sender<ShardMessage> {
        let mut hasher = DefaultHasher::new();
        subscriber.hash(&mut hasher);
        let lane = (hasher.finish() as usize) % self.shards.len();
        &self.shards[lane]
    }

    /// Event-driven or scan-driven enforcement (spec §4.8 steps 1-8).
    /// Fire-and-forget: the caller (ingest/scan loop) does not wait on the
    /// subscription API or node fan-out.
    pub async fn enforce(&self, event: ViolationEvent) {
        let subscriber = event.subscriber.clone();
        let _ = self
            .shard_for(&subscriber)
            .send(ShardMessage::Violation { event, force: false, reply: None })
            .await;
    }

    /// Admin facade "manually force an enforcement" (§4.10): bypasses the
    /// cool-down check since the operator explicitly asked for it now, but
    /// still goes through the same per-subscriber lane and the same
    /// disable/fan-out procedure.
    pub async fn force_enforce(&self, event: ViolationEvent) -> Option<EnforcementOutcome> {
        let (reply, rx) = oneshot::channel();
        let subscriber = event.subscriber.clone();
        self.shard_for(&subscriber)
            .send(ShardMessage::Violation { event, force: true, reply: Some(reply) })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Routes a single re-enable attempt through the subscriber's lane so it
    /// can never race a concurrent violation for the same subscriber.
    pub async fn trigger_reenable(&self, subscriber: String) {
        let _ = self
            .shard_for(&subscriber)
            .send(ShardMessage::ReEnable { subscriber, reply: None })
            .await;
    }

    /// Admin facade "manually un-disable a subscriber before expiry".
    pub async fn manual_unblock(&self, subscriber: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .shard_for(&subscriber)
            .send(ShardMessage::ReEnable { subscriber, reply: Some(reply) })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn is_blocked(&self, subscriber: &str) -> Option<DateTime<Utc>> {
        self.shared.blocked.get(subscriber).map(|e| *e)
    }

    pub fn blocked_list(&self) -> Vec<(String, DateTime<Utc>)> {
        self.shared.blocked.iter().map(|kv| (kv.key().clone(), *kv.value())).collect()
    }

    /// Subscribers whose disable window has elapsed, for the scheduler's
    /// re-enable sweep (§4.9).
    pub fn due_for_reenable(&self, now: DateTime<Utc>) -> Vec<String> {
        self.shared
            .blocked
            .iter()
            .filter(|kv| now >= *kv.value())
            .map(|kv| kv.key().clone())
            .collect()
    }

    pub fn prune_cooldowns(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = self
            .shared
            .cooldown
            .iter()
            .filter(|kv| kv.value().elapsed() > max_age)
            .map(|kv| kv.key().clone())
            .collect();
        for key in &stale {
            self.shared.cooldown.remove(key);
        }
        stale.len()
    }
}

async fn run_shard(mut rx: mpsc::Receiver<ShardMessage>, shared: Arc<Shared>) {
    while let Some(message) = rx.recv().await {
        match message {
            ShardMessage::Violation { event, force, reply } => {
                let outcome = handle_violation(&shared, event, force).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            ShardMessage::ReEnable { subscriber, reply } => {
                let ok = handle_reenable(&shared, &subscriber).await;
                if let Some(reply) = reply {
                    let _ = reply.send(ok);
                }
            }
        }
    }
}

async fn handle_violation(shared: &Shared, event: ViolationEvent, force: bool) -> EnforcementOutcome {
    let subscriber = event.subscriber.as_str();

    if !force {
        if let Some(last) = shared.cooldown.get(subscriber) {
            if last.elapsed() < shared.cfg.drop_cooldown {
                slog::debug!(shared.log, "enforcement suppressed by cooldown"; "subscriber" => subscriber);
                return EnforcementOutcome { disabled: false, nodes_reached: 0, nodes_total: 0 };
            }
        }
    }

    let Some(uuid) = shared.limits.get_uuid(subscriber).await else {
        slog::warn!(shared.log, "could not resolve subscriber uuid, skipping enforcement"; "subscriber" => subscriber);
        shared.cooldown.insert(subscriber.to_owned(), Instant::now());
        return EnforcementOutcome { disabled: false, nodes_reached: 0, nodes_total: 0 };
    };

    if let Err(e) = shared.api.disable(&uuid).await {
        slog::warn!(shared.log, "subscription disable call failed"; "subscriber" => subscriber, "error" => e.to_string());
        // Cooldown is still set on failure (spec §4.8 step 3) to avoid a
        // retry storm against an already-struggling upstream.
        shared.cooldown.insert(subscriber.to_owned(), Instant::now());
        return EnforcementOutcome { disabled: false, nodes_reached: 0, nodes_total: 0 };
    }

    let expires_at = Utc::now() + chrono::Duration::from_std(shared.cfg.disable_duration).unwrap_or(chrono::Duration::zero());
    shared.blocked.insert(subscriber.to_owned(), expires_at);
    persist_blocked(shared);

    let drop_ips = select_drop_ips(&event.ips, event.limit, shared.cfg.drop_all_ips);
    let nodes_total = shared.nodes.list().len();
    let mut reached = 0usize;
    for ip in &drop_ips {
        reached += shared
            .nodes
            .fan_out_block(ip, None, shared.cfg.drop_duration, &shared.log)
            .await;
    }

    slog::warn!(shared.log, "enforced subscriber violation";
        "subscriber" => subscriber, "reason" => &event.reason,
        "ips_dropped" => drop_ips.len(), "nodes_total" => nodes_total);
    shared.notifier.notify(subscriber, &event.reason, reached, nodes_total * drop_ips.len().max(1)).await;

    shared.cooldown.insert(subscriber.to_owned(), Instant::now());

    EnforcementOutcome { disabled: true, nodes_reached: reached, nodes_total: nodes_total * drop_ips.len().max(1) }
}

async fn handle_reenable(shared: &Shared, subscriber: &str) -> bool {
    let Some(expires_at) = shared.blocked.get(subscriber).map(|e| *e) else {
        // spec §7 "state inconsistency": nothing to do, not an error.
        return false;
    };

    let Some(uuid) = shared.limits.get_uuid(subscriber).await else {
        slog::warn!(shared.log, "re-enable: subscriber no longer known upstream, clearing local state"; "subscriber" => subscriber);
        shared.blocked.remove(subscriber);
        persist_blocked(shared);
        return false;
    };

    match shared.api.enable(&uuid).await {
        Ok(()) => {
            shared.blocked.remove(subscriber);
            persist_blocked(shared);
            slog::info!(shared.log, "re-enabled subscriber"; "subscriber" => subscriber, "was_due_at" => expires_at.to_rfc3339());
            true
        }
        Err(e) => {
            slog::warn!(shared.log, "re-enable call failed, will retry next sweep"; "subscriber" => subscriber, "error" => e.to_string());
            false
        }
    }
}

fn persist_blocked(shared: &Shared) {
    let snapshot: HashMap<String, DateTime<Utc>> =
        shared.blocked.iter().map(|kv| (kv.key().clone(), *kv.value())).collect();
    if let Err(e) = shared.store.save(&snapshot) {
        slog::error!(shared.log, "failed to persist blocked-subscriber state"; "error" => e.to_string());
    }
}

/// Picks which IPs to drop per the `DROP_ALL_IPS` policy knob (spec §9 open
/// question 2): either every current IP, or only the excess beyond the
/// limit. Excess selection is deterministic (lexicographic) so repeated
/// enforcement of the same subscriber targets a stable set.
fn select_drop_ips(ips: &HashSet<String>, limit: u32, drop_all: bool) -> Vec<String> {
    let mut sorted: Vec<String> = ips.iter().cloned().collect();
    sorted.sort();
    if drop_all {
        sorted
    } else {
        let keep = limit as usize;
        if sorted.len() > keep {
            sorted.split_off(keep)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_drop_ips_all_policy_drops_everything() {
        let mut ips = HashSet::new();
        ips.insert("10.0.0.1".to_owned());
        ips.insert("10.0.0.2".to_owned());
        let dropped = select_drop_ips(&ips, 1, true);
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn select_drop_ips_excess_policy_keeps_limit_worth() {
        let mut ips = HashSet::new();
        ips.insert("10.0.0.3".to_owned());
        ips.insert("10.0.0.1".to_owned());
        ips.insert("10.0.0.2".to_owned());
        let dropped = select_drop_ips(&ips, 1, false);
        assert_eq!(dropped, vec!["10.0.0.2".to_owned(), "10.0.0.3".to_owned()]);
    }

    #[test]
    fn select_drop_ips_excess_policy_no_excess_drops_nothing() {
        let mut ips = HashSet::new();
        ips.insert("10.0.0.1".to_owned());
        let dropped = select_drop_ips(&ips, 2, false);
        assert!(dropped.is_empty());
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn unique_temp_path(name: &str) -> std::path::PathBuf {
        let pid = std::process::id();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("connlimit-enforcement-test-{}-{}-{}", name, pid, nanos))
    }

    #[derive(Clone)]
    struct FakeSubscriptionApi {
        uuid: String,
        limit: u32,
        disable_calls: Arc<AtomicUsize>,
        enable_calls: Arc<AtomicUsize>,
    }

    async fn fake_get_user(State(state): State<FakeSubscriptionApi>, Path(_id): Path<String>) -> Json<serde_json::Value> {
        Json(serde_json::json!({"uuid": state.uuid, "hwidDeviceLimit": state.limit}))
    }

    async fn fake_disable(
        State(state): State<FakeSubscriptionApi>,
        Path(_uuid): Path<String>,
    ) -> axum::http::StatusCode {
        state.disable_calls.fetch_add(1, Ordering::SeqCst);
        axum::http::StatusCode::OK
    }

    async fn fake_enable(
        State(state): State<FakeSubscriptionApi>,
        Path(_uuid): Path<String>,
    ) -> axum::http::StatusCode {
        state.enable_calls.fetch_add(1, Ordering::SeqCst);
        axum::http::StatusCode::OK
    }

    /// Spins up a tiny local stand-in for the subscription API's disable/
    /// enable/lookup endpoints so `EnforcementCoordinator`'s side-effecting
    /// decisions (cooldown suppression, re-enable) can be counted directly.
    async fn spawn_fake_api(uuid: &str, limit: u32) -> (String, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let disable_calls = Arc::new(AtomicUsize::new(0));
        let enable_calls = Arc::new(AtomicUsize::new(0));
        let state = FakeSubscriptionApi {
            uuid: uuid.to_owned(),
            limit,
            disable_calls: disable_calls.clone(),
            enable_calls: enable_calls.clone(),
        };
        let app = Router::new()
            .route("/api/users/by-id/{id}", get(fake_get_user))
            .route("/api/users/{uuid}/actions/disable", post(fake_disable))
            .route("/api/users/{uuid}/actions/enable", post(fake_enable))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        (format!("http://{}", addr), disable_calls, enable_calls)
    }

    fn test_coordinator_deps(
        base_url: String,
        store_name: &str,
    ) -> (SubscriptionApiClient, Arc<LimitCache>, Arc<NodeSet>, BlockedSubscriberStore) {
        let api = SubscriptionApiClient::new(base_url, "token".to_owned());
        let limits = Arc::new(LimitCache::new(api.clone(), Duration::from_secs(60)));
        let nodes = Arc::new(NodeSet::new("shared-secret".to_owned(), Vec::new()));
        let store = BlockedSubscriberStore::new(unique_temp_path(store_name));
        (api, limits, nodes, store)
    }

    fn test_cfg() -> EnforcementConfig {
        EnforcementConfig {
            drop_cooldown: Duration::from_secs(60),
            disable_duration: Duration::from_secs(300),
            drop_duration: Duration::from_secs(60),
            drop_all_ips: false,
            shards: 1,
        }
    }

    fn violation_for(subscriber: &str, limit: u32) -> ViolationEvent {
        ViolationEvent {
            subscriber: subscriber.to_owned(),
            ips: ["10.0.0.1".to_owned(), "10.0.0.2".to_owned(), "10.0.0.3".to_owned()]
                .into_iter()
                .collect(),
            limit,
            reason: "test violation".to_owned(),
            concurrent_ips: HashSet::new(),
        }
    }

    /// Invariant 4 / S3: the same subscriber seen in two overlapping
    /// violations inside `drop_cooldown` results in exactly one
    /// `disable()` call, not two.
    #[tokio::test]
    async fn cooldown_suppresses_second_enforcement_for_same_subscriber() {
        let (base_url, disable_calls, _enable_calls) = spawn_fake_api("uuid-dana", 2).await;
        let (api, limits, nodes, store) = test_coordinator_deps(base_url, "cooldown");
        let notifier: Arc<dyn NotificationSink> = Arc::new(LoggingNotificationSink::new(test_logger()));
        let coordinator = EnforcementCoordinator::new(
            api,
            limits,
            nodes,
            store,
            HashMap::new(),
            notifier,
            test_cfg(),
            test_logger(),
        );

        coordinator.enforce(violation_for("dana", 2)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.enforce(violation_for("dana", 2)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(disable_calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_blocked("dana").is_some());
    }

    /// S4: a subscriber already past their disable expiry is re-enabled via
    /// exactly one `enable()` call and dropped from the blocked set.
    #[tokio::test]
    async fn reenable_past_expiry_enables_once_and_clears_blocked() {
        let (base_url, _disable_calls, enable_calls) = spawn_fake_api("uuid-erin", 2).await;
        let (api, limits, nodes, store) = test_coordinator_deps(base_url, "reenable");
        let notifier: Arc<dyn NotificationSink> = Arc::new(LoggingNotificationSink::new(test_logger()));

        let mut initial_blocked = HashMap::new();
        initial_blocked.insert("erin".to_owned(), Utc::now() - chrono::Duration::seconds(10));

        let coordinator = EnforcementCoordinator::new(
            api,
            limits,
            nodes,
            store,
            initial_blocked,
            notifier,
            test_cfg(),
            test_logger(),
        );

        assert!(coordinator.due_for_reenable(Utc::now()).contains(&"erin".to_owned()));

        let ok = coordinator.manual_unblock("erin".to_owned()).await;

        assert!(ok);
        assert_eq!(enable_calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_blocked("erin").is_none());
    }
}
