//! C2: upload pipeline. Bridges the tailer (C1) to the controller's ingest
//! endpoint. Supports both delivery modes named in spec §4.2, selected
//! statically by agent configuration.
//!
//! Back-pressure policy: the bounded channel between the tailer and this
//! worker already provides drop-oldest behavior for free via
//! `tokio::sync::mpsc`'s bounded semantics is NOT drop-oldest (it blocks the
//! sender), so to honor "oldest undelivered events are dropped" we run our
//! own ring buffer in front of the network call rather than relying on the
//! channel alone.

use std::collections::VecDeque;

use crate::config::UploadMode;
use crate::tailer::ParsedLine;

#[derive(Clone, Default)]
pub struct DropCounter {
    inner: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl DropCounter {
    pub fn increment(&self) {
        self.inner.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.inner.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub struct Uploader {
    client: reqwest::Client,
    controller_url: String,
    node_name: String,
    secret: String,
    mode: UploadMode,
    batch_size: usize,
    batch_interval: std::time::Duration,
    queue_capacity: usize,
    log: slog::Logger,
}

impl Uploader {
    pub fn new(
        controller_url: String,
        node_name: String,
        secret: String,
        mode: UploadMode,
        batch_size: usize,
        batch_interval: std::time::Duration,
        queue_capacity: usize,
        log: slog::Logger,
    ) -> Uploader {
        Uploader {
            client: reqwest::Client::new(),
            controller_url,
            node_name,
            secret,
            mode,
            batch_size,
            batch_interval,
            queue_capacity,
            log,
        }
    }

    pub async fn run(
        &self,
        mut lines: tokio::sync::mpsc::Receiver<ParsedLine>,
        drops: DropCounter,
    ) {
        match self.mode {
            UploadMode::Streaming => self.run_streaming(&mut lines).await,
            UploadMode::Batched => self.run_batched(&mut lines, drops).await,
        }
    }

    /// Each event is posted immediately, fire-and-forget, with a short
    /// timeout. A pending post is never awaited against new input — if the
    /// channel produces faster than we can post, `tokio::sync::mpsc`'s
    /// built-in back-pressure slows the tailer down, which is acceptable in
    /// streaming mode since there is no local queue to overflow.
    async fn run_streaming(&self, lines: &mut tokio::sync::mpsc::Receiver<ParsedLine>) {
        while let Some(parsed) = lines.recv().await {
            let body = connlimit_protocol::LogRequest {
                subscriber: parsed.entry.subscriber,
                ip: parsed.entry.ip,
                port: parsed.entry.port,
                node: self.node_name.clone(),
                secret: self.secret.clone(),
            };
            let result = self
                .client
                .post(format!("{}/log", self.controller_url))
                .json(&body)
                .timeout(std::time::Duration::from_secs(2))
                .send()
                .await;
            if let Err(e) = result {
                slog::debug!(self.log, "streaming post failed, dropping"; "error" => e.to_string());
            }
        }
    }

    /// Events are coalesced into batches of up to `batch_size` or
    /// `batch_interval`, whichever comes first. The buffer is bounded to
    /// `queue_capacity`; once full, the oldest buffered event is dropped to
    /// make room (spec §4.2: "freshness dominates completeness").
    async fn run_batched(
        &self,
        lines: &mut tokio::sync::mpsc::Receiver<ParsedLine>,
        drops: DropCounter,
    ) {
        let mut buffer: VecDeque<ParsedLine> = VecDeque::with_capacity(self.batch_size);
        let mut timer = tokio::time::interval(self.batch_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_line = lines.recv() => {
                    match maybe_line {
                        Some(parsed) => {
                            if buffer.len() >= self.queue_capacity {
                                buffer.pop_front();
                                drops.increment();
                            }
                            buffer.push_back(parsed);
                            if buffer.len() >= self.batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                self.flush(&mut buffer).await;
                            }
                            return;
                        }
                    }
                }
                _ = timer.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut VecDeque<ParsedLine>) {
        let entries: Vec<connlimit_protocol::BatchEntry> =
            buffer.drain(..).map(|p| p.entry).collect();
        let count = entries.len();
        let body = connlimit_protocol::LogBatchRequest {
            node: self.node_name.clone(),
            secret: self.secret.clone(),
            entries,
            lines: Vec::new(),
        };
        let result = self
            .client
            .post(format!("{}/log_batch", self.controller_url))
            .json(&body)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                slog::debug!(self.log, "flushed batch"; "count" => count);
            }
            Ok(resp) => {
                slog::warn!(self.log, "batch rejected by controller"; "status" => resp.status().as_u16());
            }
            Err(e) => {
                // Failure policy per spec §4.2: discard, don't retry. The
                // tailer keeps running; a missed batch just means this
                // subscriber's IPs are briefly invisible from this node.
                slog::warn!(self.log, "batch post failed, discarding"; "count" => count, "error" => e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_counter_counts() {
        let c = DropCounter::default();
        c.increment();
        c.increment();
        assert_eq!(c.get(), 2);
    }
}
