//! Message recall: the sender may retract a message within the recall window.
//!
//! Local recalls are validated here; remote recalls are trusted, since
//! authorisation was the remote sender's job. Both land in the same ledger.
//! A running node keeps the service inside `spawn_recall`'s task.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use ipmsg_protocol::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::discovery::{DiscoveryError, DiscoveryHandle};

#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error("recall window has expired")]
    TimeoutExpired,
    #[error("only the sender may recall a message")]
    NotAuthorized,
    #[error("message already recalled")]
    AlreadyRecalled,
    #[error("recall broadcast failed: {0}")]
    Broadcast(#[from] DiscoveryError),
    #[error("recall task has stopped")]
    Stopped,
}

/// Recalled message ids and when they were recalled.
#[derive(Debug, Clone)]
pub struct RecallLedger {
    window: Duration,
    retention: Duration,
    recalls: HashMap<String, DateTime<Utc>>,
}

impl RecallLedger {
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            window,
            retention,
            recalls: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn within_window(&self, message_ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - message_ts <= self.window
    }

    pub fn record(&mut self, message_id: &str, at: DateTime<Utc>) {
        self.recalls.insert(message_id.to_string(), at);
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.recalls.contains_key(message_id)
    }

    /// Drop records older than the retention period. Returns how many were dropped.
    pub fn cleanup_at(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.recalls.len();
        self.recalls.retain(|_, at| *at > cutoff);
        before - self.recalls.len()
    }

    pub fn len(&self) -> usize {
        self.recalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recalls.is_empty()
    }
}

pub struct RecallService {
    discovery: DiscoveryHandle,
    ledger: RecallLedger,
}

impl RecallService {
    pub fn new(discovery: DiscoveryHandle, window: Duration, retention: Duration) -> Self {
        Self {
            discovery,
            ledger: RecallLedger::new(window, retention),
        }
    }

    pub fn from_config(discovery: DiscoveryHandle, cfg: &NodeConfig) -> Self {
        Self::new(
            discovery,
            Duration::seconds(cfg.recall.window_secs as i64),
            Duration::hours(cfg.recall.retention_hours as i64),
        )
    }

    pub fn can_recall(
        &self,
        message_ts: DateTime<Utc>,
        sender_id: &str,
        current_user_id: &str,
        is_recalled: bool,
    ) -> bool {
        !is_recalled && sender_id == current_user_id && self.ledger.within_window(message_ts, Utc::now())
    }

    /// Validate, broadcast RECALL_MESSAGE and record the recall.
    pub async fn recall_message(
        &mut self,
        message_id: &str,
        sender_id: &str,
        current_user_id: &str,
        message_ts: DateTime<Utc>,
        is_recalled: bool,
    ) -> Result<(), RecallError> {
        if !self.ledger.within_window(message_ts, Utc::now()) {
            return Err(RecallError::TimeoutExpired);
        }
        if sender_id != current_user_id {
            return Err(RecallError::NotAuthorized);
        }
        if is_recalled || self.ledger.contains(message_id) {
            return Err(RecallError::AlreadyRecalled);
        }

        self.discovery
            .broadcast(Command::RecallMessage, message_id)
            .await?;
        self.ledger.record(message_id, Utc::now());
        tracing::info!(message_id, "recall: message recalled");
        Ok(())
    }

    /// Record a recall announced by a peer.
    pub fn handle_recall_command(&mut self, message_id: &str, from: &str) {
        tracing::debug!(message_id, from, "recall: remote recall recorded");
        self.ledger.record(message_id, Utc::now());
    }

    pub fn is_recalled(&self, message_id: &str) -> bool {
        self.ledger.contains(message_id)
    }

    pub fn cleanup_expired_recalls(&mut self) -> usize {
        let dropped = self.ledger.cleanup_at(Utc::now());
        if dropped > 0 {
            tracing::debug!(dropped, "recall: expired records pruned");
        }
        dropped
    }

    pub fn ledger(&self) -> &RecallLedger {
        &self.ledger
    }
}

// ============================================================================
// Recall task
// ============================================================================

/// How often a running recall task prunes expired records.
pub const RECALL_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

enum RecallCommand {
    Recall {
        message_id: String,
        sender_id: String,
        current_user_id: String,
        message_ts: DateTime<Utc>,
        is_recalled: bool,
        reply: oneshot::Sender<Result<(), RecallError>>,
    },
    Remote {
        message_id: String,
        from: String,
    },
    IsRecalled {
        message_id: String,
        reply: oneshot::Sender<bool>,
    },
    Cleanup {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct RecallHandle {
    cmd_tx: mpsc::Sender<RecallCommand>,
}

impl RecallHandle {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> RecallCommand,
    ) -> Result<R, RecallError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.map_err(|_| RecallError::Stopped)?;
        rx.await.map_err(|_| RecallError::Stopped)
    }

    pub async fn recall_message(
        &self,
        message_id: &str,
        sender_id: &str,
        current_user_id: &str,
        message_ts: DateTime<Utc>,
        is_recalled: bool,
    ) -> Result<(), RecallError> {
        self.request(|reply| RecallCommand::Recall {
            message_id: message_id.to_string(),
            sender_id: sender_id.to_string(),
            current_user_id: current_user_id.to_string(),
            message_ts,
            is_recalled,
            reply,
        })
        .await?
    }

    pub async fn handle_recall_command(&self, message_id: &str, from: &str) -> Result<(), RecallError> {
        self.cmd_tx
            .send(RecallCommand::Remote {
                message_id: message_id.to_string(),
                from: from.to_string(),
            })
            .await
            .map_err(|_| RecallError::Stopped)
    }

    pub async fn is_recalled(&self, message_id: &str) -> Result<bool, RecallError> {
        self.request(|reply| RecallCommand::IsRecalled {
            message_id: message_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn cleanup_expired_recalls(&self) -> Result<usize, RecallError> {
        self.request(|reply| RecallCommand::Cleanup { reply }).await
    }
}

/// Run `service` in its own task, pruning every `cleanup_interval`.
pub fn spawn_recall(
    service: RecallService,
    cleanup_interval: std::time::Duration,
    shutdown: broadcast::Receiver<()>,
) -> (RecallHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let task = tokio::spawn(run_recall_loop(service, cleanup_interval, cmd_rx, shutdown));
    (RecallHandle { cmd_tx }, task)
}

async fn run_recall_loop(
    mut service: RecallService,
    cleanup_interval: std::time::Duration,
    mut cmd_rx: mpsc::Receiver<RecallCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut cleanup = tokio::time::interval(cleanup_interval);
    cleanup.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("recall: shutting down");
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    RecallCommand::Recall { message_id, sender_id, current_user_id, message_ts, is_recalled, reply } => {
                        let result = service
                            .recall_message(&message_id, &sender_id, &current_user_id, message_ts, is_recalled)
                            .await;
                        let _ = reply.send(result);
                    }
                    RecallCommand::Remote { message_id, from } => {
                        service.handle_recall_command(&message_id, &from);
                    }
                    RecallCommand::IsRecalled { message_id, reply } => {
                        let _ = reply.send(service.is_recalled(&message_id));
                    }
                    RecallCommand::Cleanup { reply } => {
                        let _ = reply.send(service.cleanup_expired_recalls());
                    }
                }
            }
            _ = cleanup.tick() => {
                service.cleanup_expired_recalls();
            }
        }
    }
}
