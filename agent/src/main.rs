use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use git_version::git_version;
use slog::*;
use structopt::StructOpt;

mod config;
mod firewall;
mod tailer;
mod uploader;

use firewall::FirewallManager;
use tailer::{ParseMissCounter, Tailer};
use uploader::{DropCounter, Uploader};

#[derive(Debug, StructOpt)]
#[structopt(name = "connlimit-agent", about = "Per-node connection reporting and firewall-drop agent.")]
struct Opt {
    #[structopt(short = "c", long = "config", default_value = "/etc/connlimit/agent.yml")]
    config: std::path::PathBuf,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

#[derive(Clone)]
struct AppState {
    firewall: FirewallManager,
    node_name: String,
    shared_secret: String,
    parse_misses: ParseMissCounter,
    drops: DropCounter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    let opt = Opt::from_args();

    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();
    let log_level = if opt.verbose { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let root_log = slog::Logger::root(
        drain.fuse(),
        o!("build" => GIT_VERSION, "pkg-version" => env!("CARGO_PKG_VERSION")),
    );

    info!(root_log, "starting connlimit-agent"; "config" => opt.config.display().to_string());

    let cfg = config::load(&opt.config).expect("failed to load agent configuration");

    let executor: Arc<dyn firewall::Executor> = Arc::new(firewall::IptablesExecutor::new("INPUT"));
    let firewall_manager = FirewallManager::new(
        executor,
        cfg.ttl_sweep_interval,
        root_log.new(o!("subsystem" => "firewall")),
    );

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let parse_misses = ParseMissCounter::new();
    let drops = DropCounter::default();

    let tailer = Tailer::new(
        cfg.log_path.clone(),
        cfg.poll_interval,
        cfg.offset_file.clone(),
        root_log.new(o!("subsystem" => "tailer")),
    );
    let tailer_misses = parse_misses.clone();
    tokio::task::spawn(async move {
        tailer.run(tx, tailer_misses).await;
    });

    let uploader = Uploader::new(
        cfg.controller_url.clone(),
        cfg.node_name.clone(),
        cfg.shared_secret.clone(),
        cfg.upload_mode,
        cfg.batch_size,
        cfg.batch_interval,
        cfg.queue_capacity,
        root_log.new(o!("subsystem" => "uploader")),
    );
    let uploader_drops = drops.clone();
    tokio::task::spawn(async move {
        uploader.run(rx, uploader_drops).await;
    });

    let state = AppState {
        firewall: firewall_manager,
        node_name: cfg.node_name.clone(),
        shared_secret: cfg.shared_secret.clone(),
        parse_misses,
        drops,
    };

    let app = Router::new()
        .route("/block", post(handle_block))
        .route("/block_ip", post(handle_block))
        .route("/unblock", post(handle_unblock))
        .route("/unblock_ip", post(handle_unblock))
        .route("/clear", post(handle_clear))
        .route("/clear_iptables", post(handle_clear))
        .route("/health", get(handle_health))
        .route("/blocked", get(handle_blocked))
        .with_state(state);

    info!(root_log, "listening for control protocol"; "addr" => cfg.control_listen_addr.to_string());
    let listener = tokio::net::TcpListener::bind(cfg.control_listen_addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn check_secret(expected: &str, got: &str) -> bool {
    // Constant-time-ish comparison is not critical here (shared secrets are
    // rotated out-of-band, not brute-forced over this channel), but we still
    // avoid short-circuiting on the first mismatched byte via length check.
    expected.len() == got.len() && expected == got
}

async fn handle_block(
    State(state): State<AppState>,
    Json(req): Json<connlimit_protocol::BlockRequest>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    if !check_secret(&state.shared_secret, &req.secret) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    let key = connlimit_protocol::BlockKey { ip: req.ip, port: req.port };
    match state
        .firewall
        .block(key, std::time::Duration::from_secs(req.duration))
        .await
    {
        Ok(()) => Json(connlimit_protocol::OkReply::TRUE).into_response(),
        Err(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_unblock(
    State(state): State<AppState>,
    Json(req): Json<connlimit_protocol::UnblockRequest>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    if !check_secret(&state.shared_secret, &req.secret) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    let key = connlimit_protocol::BlockKey { ip: req.ip, port: req.port };
    match state.firewall.unblock(key).await {
        Ok(()) => Json(connlimit_protocol::OkReply::TRUE).into_response(),
        Err(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_clear(
    State(state): State<AppState>,
    Json(req): Json<connlimit_protocol::SecretOnlyRequest>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    if !check_secret(&state.shared_secret, &req.secret) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    match state.firewall.clear_all().await {
        Ok(()) => Json(connlimit_protocol::OkReply::TRUE).into_response(),
        Err(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<connlimit_protocol::AgentHealth> {
    Json(connlimit_protocol::AgentHealth {
        agent_id: state.node_name.clone(),
        installed_rules_count: state.firewall.installed_count().await,
        parse_misses: state.parse_misses.get(),
        upload_drops: state.drops.get(),
    })
}

async fn handle_blocked(State(state): State<AppState>) -> Json<connlimit_protocol::BlockedListReply> {
    let keys = state.firewall.list().await.into_iter().map(|k| k.to_string()).collect();
    Json(connlimit_protocol::BlockedListReply { keys })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_check_rejects_mismatch() {
        assert!(!check_secret("correct-secret", "wrong"));
        assert!(check_secret("correct-secret", "correct-secret"));
    }
}
