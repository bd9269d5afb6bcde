//! Presence -- heartbeat broadcasting and progressive eviction of silent peers.
//!
//! A peer older than the timeout collects one miss per check; it is evicted
//! only after `miss_limit` consecutive misses, so a single lost heartbeat
//! does not flap it offline. Any fresh heartbeat resets the count.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::NodeConfig;

/// Invoked once per heartbeat interval.
pub type BroadcastFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a `BroadcastFn`.
pub fn broadcast_fn<F, Fut>(f: F) -> BroadcastFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as Pin<Box<dyn Future<Output = ()> + Send>>)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub last_seen: Instant,
    pub missed_count: u32,
}

#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    timeout: Duration,
    miss_limit: u32,
    records: HashMap<String, HeartbeatRecord>,
}

impl HeartbeatTracker {
    pub fn new(timeout: Duration, miss_limit: u32) -> Self {
        Self {
            timeout,
            miss_limit,
            records: HashMap::new(),
        }
    }

    /// Latest heartbeat wins; the miss count resets.
    pub fn record_heartbeat(&mut self, peer_id: &str, at: Instant) {
        self.records.insert(
            peer_id.to_string(),
            HeartbeatRecord {
                last_seen: at,
                missed_count: 0,
            },
        );
    }

    pub fn is_online(&self, peer_id: &str, now: Instant) -> bool {
        self.records
            .get(peer_id)
            .is_some_and(|r| now.saturating_duration_since(r.last_seen) <= self.timeout)
    }

    /// Count a miss for every stale peer. Returns the peers evicted by this pass.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<String> {
        let mut evicted = Vec::new();
        for (peer_id, record) in self.records.iter_mut() {
            if now.saturating_duration_since(record.last_seen) > self.timeout {
                record.missed_count += 1;
                if record.missed_count >= self.miss_limit {
                    evicted.push(peer_id.clone());
                }
            }
        }
        for peer_id in &evicted {
            self.records.remove(peer_id);
        }
        evicted
    }

    pub fn online_peers(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn record(&self, peer_id: &str) -> Option<HeartbeatRecord> {
        self.records.get(peer_id).copied()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    pub check_interval: Duration,
    pub miss_limit: u32,
}

impl PresenceConfig {
    pub fn from_node_config(cfg: &NodeConfig) -> Self {
        Self {
            heartbeat_interval: cfg.heartbeat_interval(),
            timeout: cfg.heartbeat_timeout(),
            check_interval: Duration::from_secs(cfg.presence.timeout_check_interval_secs),
            miss_limit: cfg.presence.miss_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    PeerOnline { peer_id: String },
    PeerExpired { peer_id: String },
}

enum PresenceCommand {
    Start {
        broadcast_fn: BroadcastFn,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Heartbeat {
        peer_id: String,
    },
    IsOnline {
        peer_id: String,
        reply: oneshot::Sender<bool>,
    },
    OnlinePeers {
        reply: oneshot::Sender<Vec<String>>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("presence task has stopped")]
pub struct PresenceStopped;

/// Cloneable handle to the presence task.
#[derive(Clone)]
pub struct PresenceHandle {
    cmd_tx: mpsc::Sender<PresenceCommand>,
    event_tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.event_tx.subscribe()
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> PresenceCommand,
    ) -> Result<R, PresenceStopped> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.map_err(|_| PresenceStopped)?;
        rx.await.map_err(|_| PresenceStopped)
    }

    /// Start (or restart) the heartbeat and timeout loops.
    pub async fn start(&self, broadcast_fn: BroadcastFn) -> Result<(), PresenceStopped> {
        self.request(|reply| PresenceCommand::Start {
            broadcast_fn,
            reply,
        })
        .await
    }

    /// Cancel both loops. Safe to repeat and to call before `start`.
    pub async fn stop(&self) -> Result<(), PresenceStopped> {
        self.request(|reply| PresenceCommand::Stop { reply }).await
    }

    pub async fn record_heartbeat(&self, peer_id: impl Into<String>) -> Result<(), PresenceStopped> {
        self.cmd_tx
            .send(PresenceCommand::Heartbeat {
                peer_id: peer_id.into(),
            })
            .await
            .map_err(|_| PresenceStopped)
    }

    pub async fn is_online(&self, peer_id: impl Into<String>) -> Result<bool, PresenceStopped> {
        let peer_id = peer_id.into();
        self.request(|reply| PresenceCommand::IsOnline { peer_id, reply })
            .await
    }

    pub async fn online_peers(&self) -> Result<Vec<String>, PresenceStopped> {
        self.request(|reply| PresenceCommand::OnlinePeers { reply })
            .await
    }
}

pub fn spawn_presence(
    config: PresenceConfig,
    shutdown: broadcast::Receiver<()>,
) -> (PresenceHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(64);
    let handle = PresenceHandle {
        cmd_tx,
        event_tx: event_tx.clone(),
    };
    let task = tokio::spawn(run_presence_loop(config, cmd_rx, event_tx, shutdown));
    (handle, task)
}

/// Resolves on the next tick, or never when the loop is not running.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn interval_every(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run_presence_loop(
    config: PresenceConfig,
    mut cmd_rx: mpsc::Receiver<PresenceCommand>,
    event_tx: broadcast::Sender<PresenceEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tracker = HeartbeatTracker::new(config.timeout, config.miss_limit);
    let mut heartbeat: Option<Interval> = None;
    let mut timeouts: Option<Interval> = None;
    let mut broadcast_fn: Option<BroadcastFn> = None;
    // Heartbeat broadcasts still running; cancelled on stop
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("presence: shutting down");
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    PresenceCommand::Start { broadcast_fn: f, reply } => {
                        in_flight.shutdown().await;
                        heartbeat = Some(interval_every(config.heartbeat_interval));
                        timeouts = Some(interval_every(config.check_interval));
                        broadcast_fn = Some(f);
                        tracing::info!(
                            interval_secs = config.heartbeat_interval.as_secs_f64(),
                            timeout_secs = config.timeout.as_secs_f64(),
                            "presence: started"
                        );
                        let _ = reply.send(());
                    }
                    PresenceCommand::Stop { reply } => {
                        if heartbeat.take().is_some() {
                            tracing::info!("presence: stopped");
                        }
                        timeouts = None;
                        broadcast_fn = None;
                        in_flight.shutdown().await;
                        let _ = reply.send(());
                    }
                    PresenceCommand::Heartbeat { peer_id } => {
                        if tracker.record(&peer_id).is_none() {
                            let _ = event_tx.send(PresenceEvent::PeerOnline { peer_id: peer_id.clone() });
                        }
                        tracker.record_heartbeat(&peer_id, Instant::now());
                    }
                    PresenceCommand::IsOnline { peer_id, reply } => {
                        let _ = reply.send(tracker.is_online(&peer_id, Instant::now()));
                    }
                    PresenceCommand::OnlinePeers { reply } => {
                        let _ = reply.send(tracker.online_peers());
                    }
                }
            }
            _ = next_tick(&mut heartbeat) => {
                if let Some(f) = &broadcast_fn {
                    tracing::trace!("presence: heartbeat");
                    in_flight.spawn(f());
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = next_tick(&mut timeouts) => {
                for peer_id in tracker.check_timeouts(Instant::now()) {
                    tracing::info!(peer = %peer_id, "presence: peer expired");
                    let _ = event_tx.send(PresenceEvent::PeerExpired { peer_id });
                }
            }
        }
    }
    in_flight.shutdown().await;
}
