//! Versioned configuration loading. Same two-pass shape as the agent's
//! `config` module: read just `version`, parse the full schema for that
//! version, reshape into the version-independent `Internal` the rest of the
//! controller consumes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, serde::Deserialize)]
pub struct Version {
    pub version: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Strict,
    Smart,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NodeConfigEntry {
    pub name: String,
    pub control_addr: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1 {
    pub ingest_listen_addr: String,
    pub admin_listen_addr: String,
    pub shared_secret: String,
    pub admin_credential: String,
    pub subscription_api_url: String,
    pub subscription_api_token: String,
    #[serde(with = "humantime_serde")]
    pub ip_window: Duration,
    #[serde(with = "humantime_serde")]
    pub concurrent_window: Duration,
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub re_enable_tick: Duration,
    #[serde(with = "humantime_serde")]
    pub drop_cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub disable_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub drop_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub limit_ttl: Duration,
    pub policy: Policy,
    #[serde(default = "default_drop_all_ips")]
    pub drop_all_ips: bool,
    #[serde(default = "default_enforcement_shards")]
    pub enforcement_shards: usize,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub nodes: Vec<NodeConfigEntry>,
}

fn default_drop_all_ips() -> bool {
    true
}

fn default_enforcement_shards() -> usize {
    16
}

/// Version-independent configuration the rest of the controller consumes.
#[derive(Debug, Clone)]
pub struct Internal {
    pub ingest_listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub shared_secret: String,
    pub admin_credential: String,
    pub subscription_api_url: String,
    pub subscription_api_token: String,
    pub ip_window: Duration,
    pub concurrent_window: Duration,
    pub grace: Duration,
    pub scan_interval: Duration,
    pub prune_interval: Duration,
    pub re_enable_tick: Duration,
    pub drop_cooldown: Duration,
    pub disable_duration: Duration,
    pub drop_duration: Duration,
    pub limit_ttl: Duration,
    pub policy: Policy,
    pub drop_all_ips: bool,
    pub enforcement_shards: usize,
    pub state_path: PathBuf,
    pub nodes: Vec<NodeConfigEntry>,
}

pub fn load(path: &std::path::Path) -> anyhow::Result<Internal> {
    let raw = std::fs::read_to_string(path)?;
    let versioned: Version = serde_yaml::from_str(&raw)?;
    let version = versioned.version.unwrap_or(1);
    match version {
        1 => {
            let parsed: V1 = serde_yaml::from_str(&raw)?;
            Ok(Internal {
                ingest_listen_addr: SocketAddr::from_str(&parsed.ingest_listen_addr)?,
                admin_listen_addr: SocketAddr::from_str(&parsed.admin_listen_addr)?,
                shared_secret: parsed.shared_secret,
                admin_credential: parsed.admin_credential,
                subscription_api_url: parsed.subscription_api_url,
                subscription_api_token: parsed.subscription_api_token,
                ip_window: parsed.ip_window,
                concurrent_window: parsed.concurrent_window,
                grace: parsed.grace,
                scan_interval: parsed.scan_interval,
                prune_interval: parsed.prune_interval,
                re_enable_tick: parsed.re_enable_tick,
                drop_cooldown: parsed.drop_cooldown,
                disable_duration: parsed.disable_duration,
                drop_duration: parsed.drop_duration,
                limit_ttl: parsed.limit_ttl,
                policy: parsed.policy,
                drop_all_ips: parsed.drop_all_ips,
                enforcement_shards: parsed.enforcement_shards,
                state_path: parsed
                    .state_path
                    .unwrap_or_else(|| PathBuf::from("/var/lib/connlimit/blocked.json")),
                nodes: parsed.nodes,
            })
        }
        other => anyhow::bail!("unsupported configuration version '{}'", other),
    }
}
