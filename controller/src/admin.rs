//! C10: admin facade. Spec §4.10 leaves the implementation "intentionally
//! unconstrained" beyond the operation list and the auth model (a single
//! shared credential gated by a hash, sessions via opaque random token), so
//! this is a thin, mostly-CRUD surface rather than a component with its own
//! invariants worth agonizing over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::enforcement::EnforcementCoordinator;
use crate::index::ConnectionIndex;
use crate::limit_cache::LimitCache;
use crate::node_client::{NodeDescriptor, NodeSet};
use crate::violation::{self, ViolationConfig};

const SESSION_TTL: Duration = Duration::from_secs(3600);

fn hash_credential(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn constant_len_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a == b
}

struct SessionStore {
    tokens: DashMap<String, Instant>,
}

impl SessionStore {
    fn new() -> Self {
        SessionStore { tokens: DashMap::new() }
    }

    fn issue(&self) -> String {
        let raw: [u8; 20] = rand::thread_rng().gen();
        let token = hex_encode(&raw);
        self.tokens.insert(token.clone(), Instant::now());
        token
    }

    fn verify(&self, token: &str) -> bool {
        let fresh = matches!(self.tokens.get(token), Some(issued) if issued.elapsed() < SESSION_TTL);
        if !fresh {
            self.tokens.remove(token);
        }
        fresh
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub index: Arc<ConnectionIndex>,
    pub limits: Arc<LimitCache>,
    pub enforcement: Arc<EnforcementCoordinator>,
    pub nodes: Arc<NodeSet>,
    pub violation_cfg: Arc<ViolationConfig>,
    pub admin_credential_hash: String,
    sessions: Arc<SessionStore>,
    pub log: slog::Logger,
}

impl AdminState {
    pub fn new(
        index: Arc<ConnectionIndex>,
        limits: Arc<LimitCache>,
        enforcement: Arc<EnforcementCoordinator>,
        nodes: Arc<NodeSet>,
        violation_cfg: Arc<ViolationConfig>,
        admin_credential: String,
        log: slog::Logger,
    ) -> AdminState {
        AdminState {
            index,
            limits,
            enforcement,
            nodes,
            violation_cfg,
            admin_credential_hash: hash_credential(&admin_credential),
            sessions: Arc::new(SessionStore::new()),
            log,
        }
    }

    fn authorized(&self, token: &str) -> bool {
        self.sessions.verify(token)
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/login", post(handle_login))
        .route("/admin/status", get(handle_status))
        .route("/admin/trigger", post(handle_trigger))
        .route("/admin/unblock", post(handle_unblock))
        .route("/admin/scan", post(handle_scan))
        .route("/admin/nodes", post(handle_add_node))
        .route("/admin/nodes/{name}", delete(handle_remove_node))
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct LoginRequest {
    credential: String,
}

#[derive(serde::Serialize)]
struct LoginReply {
    token: String,
}

async fn handle_login(State(state): State<AdminState>, Json(req): Json<LoginRequest>) -> axum::response::Response {
    if !constant_len_eq(&hash_credential(&req.credential), &state.admin_credential_hash) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    let token = state.sessions.issue();
    Json(LoginReply { token }).into_response()
}

#[derive(serde::Deserialize)]
struct TokenOnly {
    token: String,
}

#[derive(serde::Serialize)]
struct NodeStatusReply {
    name: String,
    control_addr: String,
    reachable: bool,
    seconds_since_success: Option<i64>,
}

#[derive(serde::Serialize)]
struct DisabledEntry {
    subscriber: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(serde::Serialize)]
struct StatusReply {
    violators: Vec<String>,
    disabled: Vec<DisabledEntry>,
    nodes: Vec<NodeStatusReply>,
}

async fn handle_status(
    State(state): State<AdminState>,
    Json(req): Json<TokenOnly>,
) -> axum::response::Response {
    if !state.authorized(&req.token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    let disabled: Vec<DisabledEntry> = state
        .enforcement
        .blocked_list()
        .into_iter()
        .map(|(subscriber, expires_at)| DisabledEntry { subscriber, expires_at })
        .collect();
    let violators = disabled.iter().map(|d| d.subscriber.clone()).collect();

    let nodes = state
        .nodes
        .list()
        .into_iter()
        .map(|descriptor| {
            let status = state.nodes.status_of(&descriptor.name).unwrap_or(crate::node_client::NodeStatus {
                reachable: false,
                seconds_since_success: None,
            });
            NodeStatusReply {
                name: descriptor.name,
                control_addr: descriptor.control_addr,
                reachable: status.reachable,
                seconds_since_success: status.seconds_since_success,
            }
        })
        .collect();

    Json(StatusReply { violators, disabled, nodes }).into_response()
}

#[derive(serde::Deserialize)]
struct TriggerRequest {
    token: String,
    subscriber: String,
}

#[derive(serde::Serialize)]
struct TriggerReply {
    disabled: bool,
    nodes_reached: usize,
    nodes_total: usize,
}

/// "Manually force an enforcement on a subscriber" (§4.10). Builds a
/// synthetic violation from the subscriber's *current* footprint regardless
/// of whether the automatic decision procedure would have flagged it — an
/// operator invoking this has already made the call.
async fn handle_trigger(
    State(state): State<AdminState>,
    Json(req): Json<TriggerRequest>,
) -> axum::response::Response {
    if !state.authorized(&req.token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(limit) = state.limits.get_limit(&req.subscriber).await else {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    };
    let ips = state.index.ips_of(&req.subscriber, state.violation_cfg.ip_window);
    let event = violation::ViolationEvent {
        subscriber: req.subscriber.clone(),
        concurrent_ips: ips.clone(),
        ips,
        limit,
        reason: "manual operator trigger".to_owned(),
    };

    match state.enforcement.force_enforce(event).await {
        Some(outcome) => Json(TriggerReply {
            disabled: outcome.disabled,
            nodes_reached: outcome.nodes_reached,
            nodes_total: outcome.nodes_total,
        })
        .into_response(),
        None => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(serde::Deserialize)]
struct UnblockRequest {
    token: String,
    subscriber: String,
}

async fn handle_unblock(
    State(state): State<AdminState>,
    Json(req): Json<UnblockRequest>,
) -> axum::response::Response {
    if !state.authorized(&req.token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    let ok = state.enforcement.manual_unblock(req.subscriber).await;
    Json(connlimit_protocol::OkReply { ok }).into_response()
}

async fn handle_scan(State(state): State<AdminState>, Json(req): Json<TokenOnly>) -> axum::response::Response {
    if !state.authorized(&req.token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    let subscribers = state.index.active_subscribers(state.violation_cfg.ip_window);
    let count = subscribers.len();
    for subscriber in subscribers {
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
    slog::info!(state.log, "admin-triggered one-shot scan"; "subscribers" => count);
    Json(connlimit_protocol::OkReply::TRUE).into_response()
}

#[derive(serde::Deserialize)]
struct AddNodeRequest {
    token: String,
    name: String,
    control_addr: String,
}

async fn handle_add_node(
    State(state): State<AdminState>,
    Json(req): Json<AddNodeRequest>,
) -> axum::response::Response {
    if !state.authorized(&req.token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    state.nodes.upsert(NodeDescriptor { name: req.name, control_addr: req.control_addr });
    Json(connlimit_protocol::OkReply::TRUE).into_response()
}

#[derive(serde::Deserialize)]
struct RemoveNodeQuery {
    token: String,
}

async fn handle_remove_node(
    State(state): State<AdminState>,
    axum::extract::Path(name): axum::extract::Path<String>,
    Json(req): Json<RemoveNodeQuery>,
) -> axum::response::Response {
    if !state.authorized(&req.token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    let removed = state.nodes.remove(&name);
    Json(connlimit_protocol::OkReply { ok: removed }).into_response()
}
