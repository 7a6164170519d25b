//! C3: firewall executor. Installs/removes source-address (optionally
//! source-port) drop rules with TTL auto-expiry, behind the `Executor` trait
//! named in spec §9 ("Firewall coupling") so a test double can replace the
//! real `iptables` shellouts without touching the manager's logic.
//!
//! The manager itself is a single task owning the rule table, in the same
//! shape as the teacher's `enforce_via_iptables` — every mutation goes
//! through one `mpsc` channel so two `block` calls for the same key can
//! never race against each other (spec §9, open question 3).

use std::collections::HashMap;

use async_trait::async_trait;
use connlimit_protocol::BlockKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("firewall command failed: {0}")]
    CommandFailed(String),
    #[error("lost communication with firewall manager")]
    CommunicationError,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn install(&self, key: &BlockKey) -> Result<(), FirewallError>;
    async fn remove(&self, key: &BlockKey) -> Result<(), FirewallError>;
    /// Remove every rule this executor is responsible for, regardless of
    /// the local registry's contents (spec §4.3 `clear_all`).
    async fn clear_all(&self) -> Result<(), FirewallError>;
}

/// Shells out to `iptables`, matching the grammar the original node agent
/// used (`original_source/node_reporter.py`'s `block_ip`/`unblock_ip`): a
/// plain `-s <ip> -j DROP` on `INPUT` when no port is given, or a
/// `-p tcp --sport <port>` match added when one is.
pub struct IptablesExecutor {
    chain: String,
}

impl IptablesExecutor {
    pub fn new(chain: impl Into<String>) -> Self {
        IptablesExecutor { chain: chain.into() }
    }

    fn args_for<'a>(&'a self, key: &'a BlockKey, verb: &'a str) -> Vec<String> {
        let mut args = vec![
            verb.to_owned(),
            self.chain.clone(),
            "-s".to_owned(),
            key.ip.clone(),
        ];
        if let Some(port) = key.port {
            args.push("-p".to_owned());
            args.push("tcp".to_owned());
            args.push("--sport".to_owned());
            args.push(port.to_string());
        }
        args.push("-j".to_owned());
        args.push("DROP".to_owned());
        args
    }
}

#[async_trait]
impl Executor for IptablesExecutor {
    async fn install(&self, key: &BlockKey) -> Result<(), FirewallError> {
        // Check-then-insert mirrors the teacher's
        // `forwarding_reject_rule_present`/`set_forwarding_reject_rule` pair:
        // avoid a duplicate insert, which would otherwise require deleting
        // the rule multiple times to fully remove it.
        let check = tokio::process::Command::new("iptables")
            .args(self.args_for(key, "-C"))
            .status()
            .await
            .map_err(|e| FirewallError::CommandFailed(e.to_string()))?;
        if check.success() {
            return Ok(());
        }

        let status = tokio::process::Command::new("iptables")
            .args(self.args_for(key, "-I"))
            .status()
            .await
            .map_err(|e| FirewallError::CommandFailed(e.to_string()))?;
        if !status.success() {
            return Err(FirewallError::CommandFailed(format!(
                "iptables insert failed for {}",
                key
            )));
        }
        Ok(())
    }

    async fn remove(&self, key: &BlockKey) -> Result<(), FirewallError> {
        let status = tokio::process::Command::new("iptables")
            .args(self.args_for(key, "-D"))
            .status()
            .await
            .map_err(|e| FirewallError::CommandFailed(e.to_string()))?;
        if !status.success() {
            // A missing rule on delete is not fatal — it may already have
            // been cleared out-of-band by the operator.
            return Ok(());
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), FirewallError> {
        let status = tokio::process::Command::new("iptables")
            .args(["-F", &self.chain])
            .status()
            .await
            .map_err(|e| FirewallError::CommandFailed(e.to_string()))?;
        if !status.success() {
            return Err(FirewallError::CommandFailed(format!(
                "iptables -F {} failed",
                self.chain
            )));
        }
        Ok(())
    }
}

enum Command {
    Block {
        key: BlockKey,
        ttl: std::time::Duration,
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    Unblock {
        key: BlockKey,
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    ClearAll {
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    List {
        reply: tokio::sync::oneshot::Sender<Vec<BlockKey>>,
    },
    Count {
        reply: tokio::sync::oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct FirewallManager {
    dispatch: tokio::sync::mpsc::Sender<Command>,
}

impl FirewallManager {
    pub fn new(
        executor: std::sync::Arc<dyn Executor>,
        sweep_interval: std::time::Duration,
        log: slog::Logger,
    ) -> FirewallManager {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::task::spawn(run_manager(executor, rx, sweep_interval, log));
        FirewallManager { dispatch: tx }
    }

    pub async fn block(
        &self,
        key: BlockKey,
        ttl: std::time::Duration,
    ) -> Result<(), FirewallError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.dispatch
            .send(Command::Block { key, ttl, reply })
            .await
            .map_err(|_| FirewallError::CommunicationError)?;
        rx.await.map_err(|_| FirewallError::CommunicationError)?
    }

    pub async fn unblock(&self, key: BlockKey) -> Result<(), FirewallError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.dispatch
            .send(Command::Unblock { key, reply })
            .await
            .map_err(|_| FirewallError::CommunicationError)?;
        rx.await.map_err(|_| FirewallError::CommunicationError)?
    }

    pub async fn clear_all(&self) -> Result<(), FirewallError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.dispatch
            .send(Command::ClearAll { reply })
            .await
            .map_err(|_| FirewallError::CommunicationError)?;
        rx.await.map_err(|_| FirewallError::CommunicationError)?
    }

    pub async fn list(&self) -> Vec<BlockKey> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.dispatch.send(Command::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn installed_count(&self) -> usize {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.dispatch.send(Command::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run_manager(
    executor: std::sync::Arc<dyn Executor>,
    mut chan: tokio::sync::mpsc::Receiver<Command>,
    sweep_interval: std::time::Duration,
    log: slog::Logger,
) {
    let mut registry: HashMap<BlockKey, std::time::Instant> = HashMap::new();
    let mut sweep = tokio::time::interval(sweep_interval);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let now = std::time::Instant::now();
                let expired: Vec<BlockKey> = registry
                    .iter()
                    .filter(|(_, expires_at)| **expires_at <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    match executor.remove(&key).await {
                        Ok(()) => {
                            registry.remove(&key);
                            slog::info!(log, "ttl expired, removed rule"; "key" => key.to_string());
                        }
                        Err(e) => {
                            slog::warn!(log, "failed to remove expired rule, will retry next sweep"; "key" => key.to_string(), "error" => e.to_string());
                        }
                    }
                }
            }
            message = chan.recv() => {
                let Some(message) = message else { break };
                match message {
                    Command::Block { key, ttl, reply } => {
                        let result = executor.install(&key).await;
                        if result.is_ok() {
                            let new_expiry = std::time::Instant::now() + ttl;
                            registry
                                .entry(key)
                                .and_modify(|e| *e = std::cmp::max(*e, new_expiry))
                                .or_insert(new_expiry);
                        }
                        let _ = reply.send(result);
                    }
                    Command::Unblock { key, reply } => {
                        let result = executor.remove(&key).await;
                        if result.is_ok() {
                            registry.remove(&key);
                        }
                        let _ = reply.send(result);
                    }
                    Command::ClearAll { reply } => {
                        let result = executor.clear_all().await;
                        if result.is_ok() {
                            registry.clear();
                        }
                        let _ = reply.send(result);
                    }
                    Command::List { reply } => {
                        let _ = reply.send(registry.keys().cloned().collect());
                    }
                    Command::Count { reply } => {
                        let _ = reply.send(registry.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingExecutor {
        installs: std::sync::Mutex<Vec<BlockKey>>,
        removes: std::sync::Mutex<Vec<BlockKey>>,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn install(&self, key: &BlockKey) -> Result<(), FirewallError> {
            self.installs.lock().unwrap().push(key.clone());
            Ok(())
        }
        async fn remove(&self, key: &BlockKey) -> Result<(), FirewallError> {
            self.removes.lock().unwrap().push(key.clone());
            Ok(())
        }
        async fn clear_all(&self) -> Result<(), FirewallError> {
            Ok(())
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn block_then_block_is_idempotent_and_extends_ttl() {
        let executor = std::sync::Arc::new(RecordingExecutor::default());
        let manager = FirewallManager::new(executor.clone(), std::time::Duration::from_secs(5), test_logger());
        let key = BlockKey { ip: "10.0.0.1".to_owned(), port: None };

        manager.block(key.clone(), std::time::Duration::from_secs(1)).await.unwrap();
        manager.block(key.clone(), std::time::Duration::from_secs(60)).await.unwrap();

        assert_eq!(manager.installed_count().await, 1);
        assert_eq!(executor.installs.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn block_then_unblock_leaves_no_rule() {
        let executor = std::sync::Arc::new(RecordingExecutor::default());
        let manager = FirewallManager::new(executor.clone(), std::time::Duration::from_secs(5), test_logger());
        let key = BlockKey { ip: "10.0.0.2".to_owned(), port: Some(443) };

        manager.block(key.clone(), std::time::Duration::from_secs(60)).await.unwrap();
        manager.unblock(key.clone()).await.unwrap();

        assert_eq!(manager.installed_count().await, 0);
        assert_eq!(executor.removes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let executor = std::sync::Arc::new(RecordingExecutor::default());
        let manager = FirewallManager::new(executor.clone(), std::time::Duration::from_millis(20), test_logger());
        let key = BlockKey { ip: "10.0.0.3".to_owned(), port: None };

        manager.block(key.clone(), std::time::Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(manager.installed_count().await, 0);
        assert_eq!(executor.removes.lock().unwrap().len(), 1);
    }
}
