//! Typing indicators.
//!
//! Outbound TYPING broadcasts are debounced per recipient; STOP_TYPING is
//! always sent and clears the debounce stamp. Remote indicators expire after
//! the typing timeout and a periodic cleanup bounds the map.

use std::collections::HashMap;
use std::time::Duration;

use ipmsg_protocol::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::NodeConfig;
use crate::discovery::{DiscoveryError, DiscoveryHandle};

#[derive(Debug, Clone)]
pub struct TypingTracker {
    timeout: Duration,
    debounce: Duration,
    remote: HashMap<String, Instant>,
    last_sent: HashMap<String, Instant>,
}

impl TypingTracker {
    pub fn new(timeout: Duration, debounce: Duration) -> Self {
        Self {
            timeout,
            debounce,
            remote: HashMap::new(),
            last_sent: HashMap::new(),
        }
    }

    /// True when a TYPING to `to` is due; stamps the debounce timer if so.
    pub fn should_send(&mut self, to: &str, now: Instant) -> bool {
        if let Some(last) = self.last_sent.get(to) {
            if now.saturating_duration_since(*last) < self.debounce {
                return false;
            }
        }
        self.last_sent.insert(to.to_string(), now);
        true
    }

    pub fn clear_sent(&mut self, to: &str) {
        self.last_sent.remove(to);
    }

    pub fn mark_typing(&mut self, from: &str, at: Instant) {
        self.remote.insert(from.to_string(), at);
    }

    pub fn clear_typing(&mut self, from: &str) -> bool {
        self.remote.remove(from).is_some()
    }

    pub fn is_typing(&self, peer_id: &str, now: Instant) -> bool {
        self.remote
            .get(peer_id)
            .is_some_and(|at| now.saturating_duration_since(*at) <= self.timeout)
    }

    /// Drop expired indicators. Returns the peers that stopped typing.
    pub fn cleanup_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > self.timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &expired {
            self.remote.remove(peer);
        }
        expired
    }

    pub fn typing_peers(&self, now: Instant) -> Vec<String> {
        self.remote
            .keys()
            .filter(|peer| self.is_typing(peer, now))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TypingConfig {
    pub timeout: Duration,
    pub debounce: Duration,
    pub cleanup_interval: Duration,
}

impl TypingConfig {
    pub fn from_node_config(cfg: &NodeConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.typing.timeout_ms),
            debounce: Duration::from_millis(cfg.typing.debounce_ms),
            cleanup_interval: Duration::from_millis(cfg.typing.cleanup_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingEvent {
    Started { peer_id: String },
    Stopped { peer_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TypingError {
    #[error("typing broadcast failed: {0}")]
    Broadcast(#[from] DiscoveryError),
    #[error("typing task has stopped")]
    TaskStopped,
}

enum TypingCommand {
    StartTyping {
        to: String,
        reply: oneshot::Sender<Result<bool, TypingError>>,
    },
    StopTyping {
        to: String,
        reply: oneshot::Sender<Result<(), TypingError>>,
    },
    Remote {
        from: String,
        typing: bool,
    },
    IsTyping {
        peer_id: String,
        reply: oneshot::Sender<bool>,
    },
    TypingPeers {
        reply: oneshot::Sender<Vec<String>>,
    },
}

#[derive(Clone)]
pub struct TypingHandle {
    cmd_tx: mpsc::Sender<TypingCommand>,
    event_tx: broadcast::Sender<TypingEvent>,
}

impl TypingHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TypingEvent> {
        self.event_tx.subscribe()
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> TypingCommand,
    ) -> Result<R, TypingError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| TypingError::TaskStopped)?;
        rx.await.map_err(|_| TypingError::TaskStopped)
    }

    /// Broadcast TYPING to `to` unless one went out within the debounce
    /// interval. Returns whether a packet was sent.
    pub async fn start_typing(&self, to: impl Into<String>) -> Result<bool, TypingError> {
        let to = to.into();
        self.request(|reply| TypingCommand::StartTyping { to, reply })
            .await?
    }

    pub async fn stop_typing(&self, to: impl Into<String>) -> Result<(), TypingError> {
        let to = to.into();
        self.request(|reply| TypingCommand::StopTyping { to, reply })
            .await?
    }

    pub async fn handle_typing_command(&self, from: impl Into<String>) -> Result<(), TypingError> {
        self.remote(from.into(), true).await
    }

    pub async fn handle_stop_typing_command(&self, from: impl Into<String>) -> Result<(), TypingError> {
        self.remote(from.into(), false).await
    }

    async fn remote(&self, from: String, typing: bool) -> Result<(), TypingError> {
        self.cmd_tx
            .send(TypingCommand::Remote { from, typing })
            .await
            .map_err(|_| TypingError::TaskStopped)
    }

    pub async fn is_typing(&self, peer_id: impl Into<String>) -> Result<bool, TypingError> {
        let peer_id = peer_id.into();
        self.request(|reply| TypingCommand::IsTyping { peer_id, reply })
            .await
    }

    pub async fn typing_peers(&self) -> Result<Vec<String>, TypingError> {
        self.request(|reply| TypingCommand::TypingPeers { reply })
            .await
    }
}

pub fn spawn_typing(
    discovery: DiscoveryHandle,
    config: TypingConfig,
    shutdown: broadcast::Receiver<()>,
) -> (TypingHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(64);
    let handle = TypingHandle {
        cmd_tx,
        event_tx: event_tx.clone(),
    };
    let task = tokio::spawn(run_typing_loop(discovery, config, cmd_rx, event_tx, shutdown));
    (handle, task)
}

async fn run_typing_loop(
    discovery: DiscoveryHandle,
    config: TypingConfig,
    mut cmd_rx: mpsc::Receiver<TypingCommand>,
    event_tx: broadcast::Sender<TypingEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tracker = TypingTracker::new(config.timeout, config.debounce);
    let mut cleanup = tokio::time::interval(config.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("typing: shutting down");
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    TypingCommand::StartTyping { to, reply } => {
                        let result = if tracker.should_send(&to, Instant::now()) {
                            match discovery.broadcast(Command::Typing, to.as_str()).await {
                                Ok(_) => Ok(true),
                                Err(e) => {
                                    // Let the next keystroke retry
                                    tracker.clear_sent(&to);
                                    Err(e.into())
                                }
                            }
                        } else {
                            Ok(false)
                        };
                        let _ = reply.send(result);
                    }
                    TypingCommand::StopTyping { to, reply } => {
                        tracker.clear_sent(&to);
                        let result = discovery
                            .broadcast(Command::StopTyping, to.as_str())
                            .await
                            .map(|_| ())
                            .map_err(TypingError::from);
                        let _ = reply.send(result);
                    }
                    TypingCommand::Remote { from, typing: true } => {
                        let was_typing = tracker.is_typing(&from, Instant::now());
                        tracker.mark_typing(&from, Instant::now());
                        if !was_typing {
                            let _ = event_tx.send(TypingEvent::Started { peer_id: from });
                        }
                    }
                    TypingCommand::Remote { from, typing: false } => {
                        if tracker.clear_typing(&from) {
                            let _ = event_tx.send(TypingEvent::Stopped { peer_id: from });
                        }
                    }
                    TypingCommand::IsTyping { peer_id, reply } => {
                        let _ = reply.send(tracker.is_typing(&peer_id, Instant::now()));
                    }
                    TypingCommand::TypingPeers { reply } => {
                        let _ = reply.send(tracker.typing_peers(Instant::now()));
                    }
                }
            }
            _ = cleanup.tick() => {
                for peer_id in tracker.cleanup_expired(Instant::now()) {
                    tracing::trace!(peer = %peer_id, "typing: indicator expired");
                    let _ = event_tx.send(TypingEvent::Stopped { peer_id });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{spawn_discovery, DiscoveryConfig};
    use crate::transport::MockTransport;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const DEBOUNCE: Duration = Duration::from_secs(1);

    #[test]
    fn test_debounce_suppresses_within_interval() {
        let mut t = TypingTracker::new(TIMEOUT, DEBOUNCE);
        let t0 = Instant::now();
        assert!(t.should_send("bob", t0));
        assert!(!t.should_send("bob", t0 + Duration::from_millis(500)));
        assert!(t.should_send("carol", t0 + Duration::from_millis(500)));
        assert!(t.should_send("bob", t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_clear_sent_lifts_debounce() {
        let mut t = TypingTracker::new(TIMEOUT, DEBOUNCE);
        let t0 = Instant::now();
        assert!(t.should_send("bob", t0));
        t.clear_sent("bob");
        assert!(t.should_send("bob", t0 + Duration::from_millis(10)));
    }

    #[test]
    fn test_remote_typing_expires() {
        let mut t = TypingTracker::new(TIMEOUT, DEBOUNCE);
        let t0 = Instant::now();
        t.mark_typing("bob", t0);
        assert!(t.is_typing("bob", t0 + TIMEOUT));
        assert!(!t.is_typing("bob", t0 + TIMEOUT + Duration::from_millis(1)));
        assert!(!t.is_typing("carol", t0));

        assert!(t.cleanup_expired(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(t.cleanup_expired(t0 + Duration::from_secs(6)), vec!["bob".to_string()]);
        assert!(t.typing_peers(t0).is_empty());
    }

    #[test]
    fn test_explicit_stop_removes_entry() {
        let mut t = TypingTracker::new(TIMEOUT, DEBOUNCE);
        let t0 = Instant::now();
        t.mark_typing("bob", t0);
        assert!(t.clear_typing("bob"));
        assert!(!t.clear_typing("bob"));
        assert!(!t.is_typing("bob", t0));
    }

    fn spawn(config: TypingConfig) -> (TypingHandle, MockTransport, broadcast::Sender<()>) {
        let mock = MockTransport::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (discovery, _) = spawn_discovery(
            mock.clone(),
            DiscoveryConfig {
                nickname: "alice".into(),
                hostname: "alice-host".into(),
                group: None,
                port: 2425,
            },
            shutdown_tx.subscribe(),
        );
        let (handle, _) = spawn_typing(discovery, config, shutdown_tx.subscribe());
        (handle, mock, shutdown_tx)
    }

    #[tokio::test]
    async fn test_start_typing_debounced_broadcast() {
        let (handle, mock, _tx) = spawn(TypingConfig {
            timeout: TIMEOUT,
            debounce: DEBOUNCE,
            cleanup_interval: Duration::from_secs(1),
        });

        assert!(handle.start_typing("bob").await.unwrap());
        assert!(!handle.start_typing("bob").await.unwrap());
        let sent = mock.broadcast_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, Command::Typing);
        assert!(sent[0].payload.starts_with("bob\0"));

        handle.stop_typing("bob").await.unwrap();
        assert_eq!(mock.broadcast_packets()[1].command, Command::StopTyping);

        // The stop cleared the stamp, so this is not suppressed
        assert!(handle.start_typing("bob").await.unwrap());
        assert_eq!(mock.broadcasts().len(), 3);
    }

    #[tokio::test]
    async fn test_stop_typing_always_broadcasts() {
        let (handle, mock, _tx) = spawn(TypingConfig {
            timeout: TIMEOUT,
            debounce: DEBOUNCE,
            cleanup_interval: Duration::from_secs(1),
        });
        handle.stop_typing("bob").await.unwrap();
        handle.stop_typing("bob").await.unwrap();
        assert_eq!(mock.broadcasts().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_indicator_cleanup_loop() {
        let (handle, _mock, _tx) = spawn(TypingConfig {
            timeout: Duration::from_millis(30),
            debounce: DEBOUNCE,
            cleanup_interval: Duration::from_millis(10),
        });
        let mut events = handle.subscribe();

        handle.handle_typing_command("bob").await.unwrap();
        assert!(handle.is_typing("bob").await.unwrap());
        assert_eq!(handle.typing_peers().await.unwrap(), vec!["bob".to_string()]);
        assert_eq!(
            events.recv().await.unwrap(),
            TypingEvent::Started {
                peer_id: "bob".into()
            }
        );

        let stopped = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stopped,
            TypingEvent::Stopped {
                peer_id: "bob".into()
            }
        );
        assert!(!handle.is_typing("bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_stop_typing() {
        let (handle, _mock, _tx) = spawn(TypingConfig {
            timeout: TIMEOUT,
            debounce: DEBOUNCE,
            cleanup_interval: Duration::from_secs(1),
        });
        handle.handle_typing_command("bob").await.unwrap();
        handle.handle_stop_typing_command("bob").await.unwrap();
        assert!(!handle.is_typing("bob").await.unwrap());
    }
}
