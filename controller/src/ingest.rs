//! C4: ingest endpoint. `/log` and `/log_batch` admit connection reports
//! into the connection index (C5); `/health` is the only unauthenticated
//! route, matching spec §6.1's "unauthenticated paths disclose no sensitive
//! info." Every accepted request hands its touched-subscriber set to the
//! violation detector (C7) as one evaluation task per subscriber, so N
//! events for the same subscriber in one batch collapse to a single
//! evaluation (§4.4).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::enforcement::EnforcementCoordinator;
use crate::index::ConnectionIndex;
use crate::limit_cache::LimitCache;
use crate::violation::{self, ViolationConfig};

#[derive(Clone)]
pub struct IngestState {
    pub index: Arc<ConnectionIndex>,
    pub limits: Arc<LimitCache>,
    pub enforcement: Arc<EnforcementCoordinator>,
    pub violation_cfg: Arc<ViolationConfig>,
    pub shared_secret: String,
    pub log: slog::Logger,
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/log", post(handle_log))
        .route("/log_batch", post(handle_log_batch))
        .route("/health", get(handle_health))
        .with_state(state)
}

fn check_secret(expected: &str, got: &str) -> bool {
    expected.len() == got.len() && expected == got
}

fn validate_ip(raw: &str) -> Option<String> {
    raw.parse::<std::net::Ipv4Addr>().ok().map(|ip| ip.to_string())
}

async fn handle_log(
    State(state): State<IngestState>,
    Json(req): Json<connlimit_protocol::LogRequest>,
) -> axum::response::Response {
    if !check_secret(&state.shared_secret, &req.secret) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    let Some(ip) = validate_ip(&req.ip) else {
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    };
    // Defensive strip (SPEC_FULL supplemented feature #3): the tailer
    // already strips the display prefix, but a `subscriber` field arriving
    // from an older or third-party agent might not have.
    let subscriber = connlimit_protocol::strip_display_prefix(&req.subscriber);
    state.index.admit(&subscriber, &ip, &req.node);
    spawn_evaluation(&state, subscriber);
    Json(connlimit_protocol::OkReply::TRUE).into_response()
}

async fn handle_log_batch(
    State(state): State<IngestState>,
    Json(req): Json<connlimit_protocol::LogBatchRequest>,
) -> axum::response::Response {
    if !check_secret(&state.shared_secret, &req.secret) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    let mut touched = HashSet::new();
    let mut processed = 0usize;

    for entry in &req.entries {
        if let Some(ip) = validate_ip(&entry.ip) {
            let subscriber = connlimit_protocol::strip_display_prefix(&entry.subscriber);
            state.index.admit(&subscriber, &ip, &req.node);
            touched.insert(subscriber);
            processed += 1;
        }
    }

    // Raw-line batches (SPEC_FULL supplemented feature #1): the controller
    // runs the exact same line parser the tailer uses, so a raw-line batch
    // and a pre-parsed batch are equivalent to the index.
    for line in &req.lines {
        if let Some(entry) = connlimit_protocol::parse_log_line(line) {
            if let Some(ip) = validate_ip(&entry.ip) {
                state.index.admit(&entry.subscriber, &ip, &req.node);
                touched.insert(entry.subscriber);
                processed += 1;
            }
        }
    }

    for subscriber in touched {
        spawn_evaluation(&state, subscriber);
    }

    Json(connlimit_protocol::LogBatchReply { ok: true, processed }).into_response()
}

fn spawn_evaluation(state: &IngestState, subscriber: String) {
    let index = state.index.clone();
    let limits = state.limits.clone();
    let enforcement = state.enforcement.clone();
    let violation_cfg = state.violation_cfg.clone();
    tokio::task::spawn(async move {
        if let Some(event) = violation::evaluate(&subscriber, &index, &limits, &violation_cfg).await {
            enforcement.enforce(event).await;
        }
    });
}

async fn handle_health(State(state): State<IngestState>) -> Json<connlimit_protocol::ControllerHealth> {
    Json(connlimit_protocol::ControllerHealth {
        status: "ok".to_owned(),
        connections: state.index.len(),
        users: state.index.subscriber_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_check_rejects_mismatch() {
        assert!(!check_secret("correct-secret", "wrong"));
        assert!(check_secret("correct-secret", "correct-secret"));
    }

    #[test]
    fn validate_ip_rejects_garbage() {
        assert!(validate_ip("999.1.1.1").is_none());
        assert_eq!(validate_ip("10.0.0.1").as_deref(), Some("10.0.0.1"));
    }
}
