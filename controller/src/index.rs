//! C5: the connection index. A time-windowed map of `(subscriber_id, ip) ->
//! {node, last_seen}` with the secondary queries named in spec §4.5.
//!
//! Writers are the ingest endpoint and the pruner; readers are the violation
//! detector and the admin facade. Rather than a single-writer task (as used
//! for the agent's firewall registry, where every mutation is a privileged
//! shellout worth serializing), this index is read-heavy and each entry's
//! critical section is tiny, so a concurrent map (`dashmap`) is the better
//! fit here — matching spec §4.5's "a coarse lock is acceptable" note while
//! avoiding a bottleneck on the hot ingest path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Entry {
    node: String,
    last_seen: Instant,
    version: u64,
}

pub struct ConnectionIndex {
    entries: DashMap<(String, String), Entry>,
    version: AtomicU64,
}

impl ConnectionIndex {
    pub fn new() -> ConnectionIndex {
        ConnectionIndex {
            entries: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Admit or refresh one `(subscriber, ip)` observation. Duplicate
    /// reports of the same key just update `last_seen`/`node` (spec §3:
    /// "Duplicate (subscriber, ip) reports UPDATE last_seen").
    pub fn admit(&self, subscriber_id: &str, ip: &str, node: &str) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries
            .entry((subscriber_id.to_owned(), ip.to_owned()))
            .and_modify(|e| {
                e.node = node.to_owned();
                e.last_seen = Instant::now();
                e.version = version;
            })
            .or_insert_with(|| Entry {
                node: node.to_owned(),
                last_seen: Instant::now(),
                version,
            });
    }

    pub fn ips_of(&self, subscriber_id: &str, window: Duration) -> HashSet<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|kv| kv.key().0 == subscriber_id && now.saturating_duration_since(kv.value().last_seen) <= window)
            .map(|kv| kv.key().1.clone())
            .collect()
    }

    pub fn nodes_of(&self, subscriber_id: &str, window: Duration) -> HashSet<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|kv| kv.key().0 == subscriber_id && now.saturating_duration_since(kv.value().last_seen) <= window)
            .map(|kv| kv.value().node.clone())
            .collect()
    }

    /// `(ip, node, last_seen)` triples within `window`, for callers (the
    /// violation detector's `/24` dispersion check) that need more than a
    /// bare IP set.
    pub fn entries_of(&self, subscriber_id: &str, window: Duration) -> Vec<(String, String, Instant)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|kv| kv.key().0 == subscriber_id && now.saturating_duration_since(kv.value().last_seen) <= window)
            .map(|kv| (kv.key().1.clone(), kv.value().node.clone(), kv.value().last_seen))
            .collect()
    }

    pub fn active_subscribers(&self, window: Duration) -> HashSet<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|kv| now.saturating_duration_since(kv.value().last_seen) <= window)
            .map(|kv| kv.key().0.clone())
            .collect()
    }

    /// Subscribers whose entries changed since `since_version`, plus the
    /// current version to pass on the next call. Supplements the
    /// event-driven ingest path with a scan-free way to find recently-dirty
    /// subscribers (spec §4.5).
    pub fn touched_since(&self, since_version: u64) -> (HashSet<String>, u64) {
        let mut touched = HashSet::new();
        let mut max_version = since_version;
        for kv in self.entries.iter() {
            if kv.value().version > since_version {
                touched.insert(kv.key().0.clone());
                max_version = max_version.max(kv.value().version);
            }
        }
        (touched, max_version)
    }

    /// Evicts entries older than `max_age` (`IP_WINDOW + grace`). Returns
    /// the number of entries removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|kv| now.saturating_duration_since(kv.value().last_seen) > max_age)
            .map(|kv| kv.key().clone())
            .collect();
        for key in &stale {
            self.entries.remove(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Distinct subscribers currently holding any entry, pruned or not.
    /// Used for the ingest endpoint's `/health` user count (spec §6.1).
    pub fn subscriber_count(&self) -> usize {
        self.entries.iter().map(|kv| kv.key().0.clone()).collect::<HashSet<_>>().len()
    }
}

impl Default for ConnectionIndex {
    fn default() -> Self {
        Self::new()
    }
}
