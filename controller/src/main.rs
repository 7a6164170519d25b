use std::sync::Arc;

use git_version::git_version;
use slog::*;
use structopt::StructOpt;

mod admin;
mod config;
mod enforcement;
mod ingest;
mod index;
mod limit_cache;
mod node_client;
mod persist;
mod scheduler;
mod subscription_api;
mod violation;

use enforcement::{EnforcementConfig, EnforcementCoordinator, LoggingNotificationSink};
use index::ConnectionIndex;
use limit_cache::LimitCache;
use node_client::{NodeDescriptor, NodeSet};
use persist::BlockedSubscriberStore;
use subscription_api::SubscriptionApiClient;
use violation::ViolationConfig;

#[derive(Debug, StructOpt)]
#[structopt(name = "connlimit-controller", about = "Per-subscriber device/IP-count enforcement controller.")]
struct Opt {
    #[structopt(short = "c", long = "config", default_value = "/etc/connlimit/controller.yml")]
    config: std::path::PathBuf,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
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

    info!(root_log, "starting connlimit-controller"; "config" => opt.config.display().to_string());

    let cfg = config::load(&opt.config).expect("failed to load controller configuration");

    let api = SubscriptionApiClient::new(cfg.subscription_api_url.clone(), cfg.subscription_api_token.clone());
    let limits = Arc::new(LimitCache::new(api.clone(), cfg.limit_ttl));
    let index = Arc::new(ConnectionIndex::new());

    let node_descriptors: Vec<NodeDescriptor> = cfg
        .nodes
        .iter()
        .map(|n| NodeDescriptor { name: n.name.clone(), control_addr: n.control_addr.clone() })
        .collect();
    let nodes = Arc::new(NodeSet::new(cfg.shared_secret.clone(), node_descriptors));

    let store = BlockedSubscriberStore::new(cfg.state_path.clone());
    let persisted_blocked = store.load().unwrap_or_else(|e| {
        warn!(root_log, "failed to load persisted blocked-subscriber state, starting empty"; "error" => e.to_string());
        Default::default()
    });
    info!(root_log, "resumed persisted disable state"; "count" => persisted_blocked.len());

    let notifier = Arc::new(LoggingNotificationSink::new(root_log.new(o!("subsystem" => "notifier"))));

    let enforcement_cfg = EnforcementConfig {
        drop_cooldown: cfg.drop_cooldown,
        disable_duration: cfg.disable_duration,
        drop_duration: cfg.drop_duration,
        drop_all_ips: cfg.drop_all_ips,
        shards: cfg.enforcement_shards,
    };
    let enforcement = EnforcementCoordinator::new(
        api,
        limits.clone(),
        nodes.clone(),
        store,
        persisted_blocked,
        notifier,
        enforcement_cfg,
        root_log.new(o!("subsystem" => "enforcement")),
    );

    let violation_cfg = Arc::new(ViolationConfig {
        policy: cfg.policy,
        ip_window: cfg.ip_window,
        concurrent_window: cfg.concurrent_window,
    });

    scheduler::spawn(
        index.clone(),
        limits.clone(),
        enforcement.clone(),
        violation_cfg.clone(),
        scheduler::SchedulerConfig {
            scan_interval: cfg.scan_interval,
            prune_interval: cfg.prune_interval,
            re_enable_tick: cfg.re_enable_tick,
            index_max_age: cfg.ip_window + cfg.grace,
            limit_cache_max_age: cfg.limit_ttl * 4,
            cooldown_max_age: cfg.drop_cooldown * 2,
        },
        root_log.new(o!("subsystem" => "scheduler")),
    );

    let ingest_state = ingest::IngestState {
        index: index.clone(),
        limits: limits.clone(),
        enforcement: enforcement.clone(),
        violation_cfg: violation_cfg.clone(),
        shared_secret: cfg.shared_secret.clone(),
        log: root_log.new(o!("subsystem" => "ingest")),
    };
    let ingest_app = ingest::router(ingest_state);

    let admin_state = admin::AdminState::new(
        index,
        limits,
        enforcement,
        nodes,
        violation_cfg,
        cfg.admin_credential.clone(),
        root_log.new(o!("subsystem" => "admin")),
    );
    let admin_app = admin::router(admin_state);

    info!(root_log, "listening for ingest protocol"; "addr" => cfg.ingest_listen_addr.to_string());
    info!(root_log, "listening for admin facade"; "addr" => cfg.admin_listen_addr.to_string());

    let ingest_listener = tokio::net::TcpListener::bind(cfg.ingest_listen_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(cfg.admin_listen_addr).await?;

    let ingest_serve = axum::serve(ingest_listener, ingest_app.into_make_service());
    let admin_serve = axum::serve(admin_listener, admin_app.into_make_service());

    tokio::try_join!(
        async { ingest_serve.await.map_err(anyhow::Error::from) },
        async { admin_serve.await.map_err(anyhow::Error::from) },
    )?;

    Ok(())
}
