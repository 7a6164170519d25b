//! Versioned configuration loading, mirroring the two-pass approach the
//! controller also uses: read just `version` first, then parse the full
//! schema for that version, then reshape into the internal struct the rest
//! of the program consumes. This lets the on-disk schema evolve without
//! breaking call sites elsewhere in the agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, serde::Deserialize)]
pub struct Version {
    pub version: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Streaming,
    Batched,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1 {
    pub node_name: String,
    pub log_path: PathBuf,
    pub controller_url: String,
    pub shared_secret: String,
    pub control_listen_addr: String,
    pub upload_mode: UploadMode,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub batch_interval: std::time::Duration,
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub ttl_sweep_interval: std::time::Duration,
    #[serde(default)]
    pub offset_file: Option<PathBuf>,
}

/// The internal, version-independent configuration the rest of the agent
/// consumes. Kept distinct from the on-disk schema so future config
/// versions only need a new `V2`-to-`Internal` mapping.
#[derive(Debug, Clone)]
pub struct Internal {
    pub node_name: String,
    pub log_path: PathBuf,
    pub controller_url: String,
    pub shared_secret: String,
    pub control_listen_addr: SocketAddr,
    pub upload_mode: UploadMode,
    pub batch_size: usize,
    pub batch_interval: std::time::Duration,
    pub queue_capacity: usize,
    pub poll_interval: std::time::Duration,
    pub ttl_sweep_interval: std::time::Duration,
    pub offset_file: Option<PathBuf>,
}

pub fn load(path: &std::path::Path) -> anyhow::Result<Internal> {
    let raw = std::fs::read_to_string(path)?;
    let versioned: Version = serde_yaml::from_str(&raw)?;
    let version = versioned.version.unwrap_or(1);
    match version {
        1 => {
            let parsed: V1 = serde_yaml::from_str(&raw)?;
            Ok(Internal {
                node_name: parsed.node_name,
                log_path: parsed.log_path,
                controller_url: parsed.controller_url,
                shared_secret: parsed.shared_secret,
                control_listen_addr: SocketAddr::from_str(&parsed.control_listen_addr)?,
                upload_mode: parsed.upload_mode,
                batch_size: parsed.batch_size,
                batch_interval: parsed.batch_interval,
                queue_capacity: parsed.queue_capacity,
                poll_interval: parsed.poll_interval,
                ttl_sweep_interval: parsed.ttl_sweep_interval,
                offset_file: parsed.offset_file,
            })
        }
        other => anyhow::bail!("unsupported configuration version '{}'", other),
    }
}
