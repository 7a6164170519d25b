//! C1: log tailer. Follows the access log across rotation and truncation,
//! parsing matching lines into `connlimit_protocol::BatchEntry` and sending
//! them down a channel to the upload pipeline (C2).
//!
//! Modeled on the teacher's worker-owns-its-state pattern: this is a single
//! long-lived task, not a struct with public mutating methods, so there is
//! never a question of who else might be touching the file handle.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt};

#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub entry: connlimit_protocol::BatchEntry,
}

/// On-disk shape for the optional tail-offset file (spec §6.4): file
/// identity plus byte offset, so a restart can resume mid-file instead of
/// jumping to the current tail and losing whatever was written while the
/// agent was down. Absence of the file, or a mismatched identity (rotation
/// happened while stopped), is non-fatal — the tailer just falls back to
/// seeking to the current end.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
struct OffsetRecord {
    dev: u64,
    ino: u64,
    offset: u64,
}

pub struct Tailer {
    path: PathBuf,
    poll_interval: std::time::Duration,
    offset_file: Option<PathBuf>,
    log: slog::Logger,
}

struct OpenFile {
    reader: tokio::io::BufReader<tokio::fs::File>,
    dev: u64,
    ino: u64,
    bytes_read: u64,
}

impl Tailer {
    pub fn new(
        path: PathBuf,
        poll_interval: std::time::Duration,
        offset_file: Option<PathBuf>,
        log: slog::Logger,
    ) -> Tailer {
        Tailer {
            path,
            poll_interval,
            offset_file,
            log,
        }
    }

    /// Run forever, sending every matched line to `out`. Returns only if the
    /// channel is closed on the receiving end (agent shutdown).
    pub async fn run(
        &self,
        out: tokio::sync::mpsc::Sender<ParsedLine>,
        mut parse_misses: ParseMissCounter,
    ) {
        // On startup, prefer a persisted offset for this exact file identity
        // (spec §6.4); otherwise resume at the current tail so we don't
        // replay the entire historical log. Any later reopen (rotation,
        // truncation, reappearance) starts from the beginning of the new
        // file.
        let mut current = self.open(true).await;
        let mut since_persist = std::time::Instant::now();

        loop {
            let mut line = String::new();
            match current.reader.read_line(&mut line).await {
                Ok(0) => {
                    if self.needs_reopen(&current).await {
                        slog::info!(self.log, "log file rotated or truncated, reopening"; "path" => self.path.display().to_string());
                        current = self.open(false).await;
                        continue;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(n) => {
                    current.bytes_read += n as u64;
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    match connlimit_protocol::parse_log_line(trimmed) {
                        Some(entry) => {
                            if out.send(ParsedLine { entry }).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            parse_misses.increment();
                        }
                    }
                    if since_persist.elapsed() >= self.poll_interval.max(std::time::Duration::from_millis(500)) {
                        self.persist_offset(&current);
                        since_persist = std::time::Instant::now();
                    }
                }
                Err(e) => {
                    slog::warn!(self.log, "error reading log file, reopening"; "error" => e.to_string());
                    current = self.open(false).await;
                }
            }
        }
    }

    fn persist_offset(&self, current: &OpenFile) {
        let Some(offset_path) = &self.offset_file else { return };
        let record = OffsetRecord { dev: current.dev, ino: current.ino, offset: current.bytes_read };
        let Ok(serialized) = serde_json::to_string(&record) else { return };
        if let Err(e) = std::fs::write(offset_path, serialized) {
            slog::debug!(self.log, "failed to persist tail offset"; "error" => e.to_string());
        }
    }

    fn load_offset(&self) -> Option<OffsetRecord> {
        let offset_path = self.offset_file.as_ref()?;
        let raw = std::fs::read_to_string(offset_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// True if the file at `self.path` is no longer the file we have open —
    /// either a different inode (rotation), shorter than our read offset
    /// (truncation) — or has vanished entirely.
    async fn needs_reopen(&self, current: &OpenFile) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                (meta.dev(), meta.ino()) != (current.dev, current.ino)
                    || meta.len() < current.bytes_read
            }
            Err(_) => true,
        }
    }

    /// Open the log file, polling with the configured interval while it is
    /// absent (spec §4.1: "temporary absence"). `seek_to_end` controls
    /// whether we resume at the tail (startup) or read from the beginning
    /// (post-rotation/truncation/reappearance).
    async fn open(&self, seek_to_end: bool) -> OpenFile {
        loop {
            match tokio::fs::File::open(&self.path).await {
                Ok(mut file) => {
                    let meta = match file.metadata().await {
                        Ok(m) => m,
                        Err(_) => {
                            tokio::time::sleep(self.poll_interval).await;
                            continue;
                        }
                    };
                    let mut bytes_read = 0;
                    if seek_to_end {
                        let persisted = self.load_offset().filter(|r| {
                            r.dev == meta.dev() && r.ino == meta.ino() && r.offset <= meta.len()
                        });
                        let seek_pos = persisted.map(|r| r.offset).unwrap_or(meta.len());
                        match file.seek(std::io::SeekFrom::Start(seek_pos)).await {
                            Ok(pos) => bytes_read = pos,
                            Err(_) => {
                                tokio::time::sleep(self.poll_interval).await;
                                continue;
                            }
                        }
                    }
                    return OpenFile {
                        reader: tokio::io::BufReader::new(file),
                        dev: meta.dev(),
                        ino: meta.ino(),
                        bytes_read,
                    };
                }
                Err(_) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// A cheap metric counter for parse misses (spec §7: "not an error, just a
/// metric"). Shared with whatever exposes agent health.
#[derive(Clone, Default)]
pub struct ParseMissCounter {
    inner: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ParseMissCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self) {
        self.inner.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.inner.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn unique_temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "connlimit-agent-test-{}-{}-{}",
            name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[tokio::test]
    async fn tails_appended_lines_and_skips_non_matches() {
        let path = unique_temp_path("tail-basic");
        std::fs::write(&path, "").unwrap();

        let tailer = Tailer::new(path.clone(), std::time::Duration::from_millis(5), None, test_logger());
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let misses = ParseMissCounter::new();

        let run_misses = misses.clone();
        let run_handle = tokio::spawn(async move {
            tailer.run(tx, run_misses).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "unrelated line with no markers").unwrap();
            writeln!(f, "from tcp:198.51.100.4:443 accepted email: user_7").unwrap();
        }

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for parsed line")
            .expect("channel closed early");

        assert_eq!(received.entry.ip, "198.51.100.4");
        assert_eq!(received.entry.subscriber, "7");

        run_handle.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn detects_truncation_and_resumes_from_start() {
        let path = unique_temp_path("tail-truncate");
        std::fs::write(&path, "from 10.0.0.1:1 email: a_very_long_subscriber_name_here\n").unwrap();

        let tailer = Tailer::new(path.clone(), std::time::Duration::from_millis(5), None, test_logger());
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let misses = ParseMissCounter::new();
        let run_handle = tokio::spawn(async move {
            tailer.run(tx, misses).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Replace with a strictly shorter file; the tailer started at EOF of
        // the long file, so the shrink must be detected as truncation.
        std::fs::write(&path, "from 10.0.0.2:2 email: b\n").unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for parsed line")
            .expect("channel closed early");

        assert_eq!(received.entry.subscriber, "b");

        run_handle.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn resumes_from_persisted_offset_instead_of_current_tail() {
        let path = unique_temp_path("tail-offset");
        let offset_path = unique_temp_path("tail-offset-file");
        std::fs::write(
            &path,
            "from 10.0.0.9:1 email: skip_me\nfrom 10.0.0.8:2 email: also_skip\n",
        )
        .unwrap();

        // Record an offset that lands right after the two seeded lines, as
        // if a prior run had already forwarded them before stopping.
        let meta = std::fs::metadata(&path).unwrap();
        let offset_record = OffsetRecord {
            dev: meta.dev(),
            ino: meta.ino(),
            offset: meta.len(),
        };
        std::fs::write(&offset_path, serde_json::to_string(&offset_record).unwrap()).unwrap();

        let tailer = Tailer::new(
            path.clone(),
            std::time::Duration::from_millis(5),
            Some(offset_path.clone()),
            test_logger(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let misses = ParseMissCounter::new();
        let run_handle = tokio::spawn(async move {
            tailer.run(tx, misses).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "from 10.0.0.7:3 email: after_restart").unwrap();
        }

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for parsed line")
            .expect("channel closed early");

        // Only the post-restart line should surface; the two seeded lines
        // before the persisted offset must not be replayed.
        assert_eq!(received.entry.subscriber, "after_restart");

        run_handle.abort();
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&offset_path);
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }
}
