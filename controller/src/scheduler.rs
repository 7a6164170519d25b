//! C9: scheduler. Three independent periodic tasks — scan, prune, and the
//! re-enable sweep — each on its own cadence, matching §5's "independent
//! long-lived periodic task" workers and the teacher's single
//! `tokio::select!`-driven timer inside `enforce_via_iptables`, just split
//! into three tasks here since the three cadences are genuinely unrelated.

use std::sync::Arc;
use std::time::Duration;

use crate::enforcement::EnforcementCoordinator;
use crate::index::ConnectionIndex;
use crate::limit_cache::LimitCache;
use crate::violation::{self, ViolationConfig};

pub struct SchedulerConfig {
    pub scan_interval: Duration,
    pub prune_interval: Duration,
    pub re_enable_tick: Duration,
    pub index_max_age: Duration,
    pub limit_cache_max_age: Duration,
    pub cooldown_max_age: Duration,
}

pub fn spawn(
    index: Arc<ConnectionIndex>,
    limits: Arc<LimitCache>,
    enforcement: Arc<EnforcementCoordinator>,
    violation_cfg: Arc<ViolationConfig>,
    cfg: SchedulerConfig,
    log: slog::Logger,
) {
    tokio::task::spawn(scan_loop(
        index.clone(),
        limits.clone(),
        enforcement.clone(),
        violation_cfg,
        cfg.scan_interval,
        log.new(slog::o!("task" => "scan")),
    ));
    tokio::task::spawn(prune_loop(
        index,
        limits,
        enforcement.clone(),
        cfg.prune_interval,
        cfg.index_max_age,
        cfg.limit_cache_max_age,
        cfg.cooldown_max_age,
        log.new(slog::o!("task" => "prune")),
    ));
    tokio::task::spawn(reenable_loop(
        enforcement,
        cfg.re_enable_tick,
        log.new(slog::o!("task" => "reenable")),
    ));
}

/// Belt-and-suspenders with the event-driven path (spec §4.9): re-evaluates
/// every subscriber with fresh entries on a cadence, in case an ingest-time
/// evaluation was lost or never fired (e.g. the agent only ever reported a
/// subscriber's second IP without a fresh first-IP event in this process's
/// lifetime).
async fn scan_loop(
    index: Arc<ConnectionIndex>,
    limits: Arc<LimitCache>,
    enforcement: Arc<EnforcementCoordinator>,
    violation_cfg: Arc<ViolationConfig>,
    interval: Duration,
    log: slog::Logger,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let subscribers = index.active_subscribers(violation_cfg.ip_window);
        slog::debug!(log, "scan tick"; "active_subscribers" => subscribers.len());
        for subscriber in subscribers {
            let index = index.clone();
            let limits = limits.clone();
            let enforcement = enforcement.clone();
            let violation_cfg = violation_cfg.clone();
            tokio::task::spawn(async move {
                if let Some(event) = violation::evaluate(&subscriber, &index, &limits, &violation_cfg).await {
                    enforcement.enforce(event).await;
                }
            });
        }
    }
}

async fn prune_loop(
    index: Arc<ConnectionIndex>,
    limits: Arc<LimitCache>,
    enforcement: Arc<EnforcementCoordinator>,
    interval: Duration,
    index_max_age: Duration,
    limit_cache_max_age: Duration,
    cooldown_max_age: Duration,
    log: slog::Logger,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let evicted_connections = index.prune(index_max_age);
        let evicted_limits = limits.prune(limit_cache_max_age);
        let evicted_cooldowns = enforcement.prune_cooldowns(cooldown_max_age);
        slog::debug!(log, "prune tick";
            "connections" => evicted_connections,
            "limit_cache" => evicted_limits,
            "cooldowns" => evicted_cooldowns);
    }
}

/// For each `BlockedSubscriber` past expiry, triggers §4.8's re-enable path.
/// A controller restart resumes these timers for free: the persisted map is
/// loaded at startup (main.rs), and the next tick here finds anything
/// already past its `expires_at` and re-enables it immediately.
async fn reenable_loop(enforcement: Arc<EnforcementCoordinator>, interval: Duration, log: slog::Logger) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let due = enforcement.due_for_reenable(chrono::Utc::now());
        if !due.is_empty() {
            slog::info!(log, "re-enable sweep"; "due" => due.len());
        }
        for subscriber in due {
            enforcement.trigger_reenable(subscriber).await;
        }
    }
}
