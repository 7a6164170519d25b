//! Durable `BlockedSubscriber` state (spec §6.4): a small JSON file,
//! rewritten on each change, read back at startup so a restart resumes
//! re-enable timers rather than forgetting who is disabled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct OnDisk {
    entries: HashMap<String, DateTime<Utc>>,
}

pub struct BlockedSubscriberStore {
    path: PathBuf,
}

impl BlockedSubscriberStore {
    pub fn new(path: PathBuf) -> BlockedSubscriberStore {
        BlockedSubscriberStore { path }
    }

    /// Reads the persisted map, or an empty one if the file is absent —
    /// a missing state file is non-fatal (first run, or fresh volume).
    pub fn load(&self) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let on_disk: OnDisk = serde_json::from_str(&raw)?;
        Ok(on_disk.entries)
    }

    /// Rewrites the whole file from the given map. Writes to a temp path
    /// in the same directory and renames over the target so a crash
    /// mid-write never leaves a half-written file behind.
    pub fn save(&self, entries: &HashMap<String, DateTime<Utc>>) -> anyhow::Result<()> {
        let on_disk = OnDisk { entries: entries.clone() };
        let serialized = serde_json::to_string_pretty(&on_disk)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_path(name: &str) -> PathBuf {
        let pid = std::process::id();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("connlimit-test-{}-{}-{}", name, pid, nanos))
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = BlockedSubscriberStore::new(unique_temp_path("missing"));
        let loaded = store.load().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = unique_temp_path("roundtrip");
        let store = BlockedSubscriberStore::new(path.clone());
        let mut entries = HashMap::new();
        entries.insert("alice".to_owned(), Utc::now());
        store.save(&entries).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("alice"));

        std::fs::remove_file(&path).ok();
    }
}
