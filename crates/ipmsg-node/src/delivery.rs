//! Reliable unicast -- pooled TCP connections with bounded retry.
//!
//! One pooled connection per host. A pooled entry is reused only while it
//! reports itself connected; any failed attempt evicts it so the next attempt
//! dials fresh. Attempts are spaced `base_delay * 2^attempt` apart. Packets
//! are length-prefixed so one connection carries any number of them.
//!
//! `spawn_delivery` runs a service inside its own task. That task owns the
//! sequence counter and hands each host to a lane task of its own, so
//! retries against one unreachable host never hold up another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipmsg_protocol::{Command, Packet, PacketCodec, ProtocolError, PROTOCOL_VERSION};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionError, ConnectionFactory, TcpConnectionFactory};

/// Backoff stops doubling after this many attempts.
const MAX_BACKOFF_EXPONENT: u32 = 16;

const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("gave up on {host}:{port} after retries")]
    MaxRetriesExceeded { host: String, port: u16 },
    #[error("forward to {host} failed")]
    ForwardFailed { host: String },
    #[error("packet encoding failed: {0}")]
    Encoding(#[from] ProtocolError),
    #[error("delivery task has stopped")]
    Stopped,
}

/// Delay before the attempt following `attempt` (zero-based).
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT)))
}

pub struct DeliveryService {
    factory: Arc<dyn ConnectionFactory>,
    pool: HashMap<String, Arc<dyn Connection>>,
    sequence: i64,
    sender_name: String,
    sender_host: String,
    max_retries: u32,
    base_delay: Duration,
}

impl DeliveryService {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        sender_name: impl Into<String>,
        sender_host: impl Into<String>,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            factory,
            pool: HashMap::new(),
            sequence: 0,
            sender_name: sender_name.into(),
            sender_host: sender_host.into(),
            max_retries,
            base_delay,
        }
    }

    /// Production service dialling real TCP connections.
    pub fn from_config(cfg: &NodeConfig) -> Self {
        let factory = TcpConnectionFactory::new(Duration::from_secs(cfg.delivery.connect_timeout_secs));
        Self::new(
            Arc::new(factory),
            cfg.node.nickname.clone(),
            cfg.node.hostname.clone(),
            cfg.delivery.max_retries,
            Duration::from_millis(cfg.delivery.base_delay_ms),
        )
    }

    /// Same sender and retry policy, empty pool.
    fn fresh(&self) -> Self {
        Self::new(
            self.factory.clone(),
            self.sender_name.clone(),
            self.sender_host.clone(),
            self.max_retries,
            self.base_delay,
        )
    }

    /// Send a SEND_MESSAGE packet. Returns its sequence number.
    pub async fn send_message(
        &mut self,
        content: &str,
        host: &str,
        port: u16,
    ) -> Result<i64, DeliveryError> {
        self.sequence += 1;
        self.send_numbered(self.sequence, content, host, port).await
    }

    /// Send a SEND_MESSAGE packet under a sequence number chosen by the caller.
    pub async fn send_numbered(
        &mut self,
        sequence_no: i64,
        content: &str,
        host: &str,
        port: u16,
    ) -> Result<i64, DeliveryError> {
        let packet = Packet::new(
            PROTOCOL_VERSION,
            sequence_no,
            self.sender_name.clone(),
            self.sender_host.clone(),
            Command::SendMessage,
            content,
        );
        let frame = PacketCodec::frame(&packet)?;
        self.send_with_retry(frame, host, port).await?;
        tracing::info!(host, port, seq = sequence_no, "delivery: message sent");
        Ok(sequence_no)
    }

    /// Resend `content` to another host over TCP.
    pub async fn forward_message(
        &mut self,
        content: &str,
        host: &str,
        port: u16,
    ) -> Result<i64, DeliveryError> {
        self.send_message(content, host, port)
            .await
            .map_err(|_| DeliveryError::ForwardFailed {
                host: host.to_string(),
            })
    }

    /// Write `data` as-is, retrying with backoff.
    pub async fn send_with_retry(
        &mut self,
        data: Vec<u8>,
        host: &str,
        port: u16,
    ) -> Result<(), DeliveryError> {
        let data = Arc::new(data);
        for attempt in 0..self.max_retries {
            match self.attempt_send(data.clone(), host, port).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(host, port, attempt, "delivery: attempt failed: {e}");
                    if let Some(stale) = self.pool.remove(host) {
                        stale.disconnect();
                    }
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(backoff(self.base_delay, attempt)).await;
                    }
                }
            }
        }
        Err(DeliveryError::MaxRetriesExceeded {
            host: host.to_string(),
            port,
        })
    }

    async fn attempt_send(
        &mut self,
        data: Arc<Vec<u8>>,
        host: &str,
        port: u16,
    ) -> Result<(), ConnectionError> {
        let conn = self.connection_for(host, port).await?;
        tokio::task::spawn_blocking(move || conn.send(&data))
            .await
            .map_err(|_| ConnectionError::SendFailed)?
    }

    async fn connection_for(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        if let Some(existing) = self.pool.get(host) {
            if existing.is_connected() {
                return Ok(existing.clone());
            }
        }
        self.pool.remove(host);

        let factory = self.factory.clone();
        let target = host.to_string();
        let conn = tokio::task::spawn_blocking(move || factory.connect(&target, port))
            .await
            .map_err(|_| ConnectionError::ConnectionFailed {
                host: host.to_string(),
                port,
            })??;
        tracing::debug!(host, port, pool_size = self.pool.len() + 1, "delivery: connection pooled");
        self.pool.insert(host.to_string(), conn.clone());
        Ok(conn)
    }

    pub fn disconnect(&mut self, host: &str) {
        if let Some(conn) = self.pool.remove(host) {
            conn.disconnect();
        }
    }

    pub fn disconnect_all(&mut self) {
        for (_, conn) in self.pool.drain() {
            conn.disconnect();
        }
    }

    pub fn active_connections(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for DeliveryService {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

// ============================================================================
// Delivery task
// ============================================================================

enum DeliveryCommand {
    Send {
        content: String,
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<i64, DeliveryError>>,
    },
    ActiveConnections {
        reply: oneshot::Sender<usize>,
    },
    DisconnectAll {
        reply: oneshot::Sender<()>,
    },
}

struct LaneJob {
    sequence_no: i64,
    content: String,
    port: u16,
    reply: oneshot::Sender<Result<i64, DeliveryError>>,
}

/// Sender side of one host's lane.
struct Lane {
    tx: mpsc::UnboundedSender<LaneJob>,
    connected: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct DeliveryHandle {
    cmd_tx: mpsc::Sender<DeliveryCommand>,
}

impl DeliveryHandle {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> DeliveryCommand,
    ) -> Result<R, DeliveryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| DeliveryError::Stopped)?;
        rx.await.map_err(|_| DeliveryError::Stopped)
    }

    /// Send a SEND_MESSAGE packet. Returns its sequence number.
    pub async fn send_message(&self, content: &str, host: &str, port: u16) -> Result<i64, DeliveryError> {
        self.request(|reply| DeliveryCommand::Send {
            content: content.to_string(),
            host: host.to_string(),
            port,
            reply,
        })
        .await?
    }

    pub async fn forward_message(&self, content: &str, host: &str, port: u16) -> Result<i64, DeliveryError> {
        self.send_message(content, host, port)
            .await
            .map_err(|_| DeliveryError::ForwardFailed {
                host: host.to_string(),
            })
    }

    /// Hosts whose lane currently holds a live pooled connection.
    pub async fn active_connections(&self) -> Result<usize, DeliveryError> {
        self.request(|reply| DeliveryCommand::ActiveConnections { reply })
            .await
    }

    /// Close every pooled connection. Sends still queued fail with `Stopped`.
    pub async fn disconnect_all(&self) -> Result<(), DeliveryError> {
        self.request(|reply| DeliveryCommand::DisconnectAll { reply })
            .await
    }
}

/// Run `service` in its own task. Its sequence counter carries over.
pub fn spawn_delivery(
    service: DeliveryService,
    shutdown: broadcast::Receiver<()>,
) -> (DeliveryHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let task = tokio::spawn(run_delivery_loop(service, cmd_rx, shutdown));
    (DeliveryHandle { cmd_tx }, task)
}

async fn run_delivery_loop(
    template: DeliveryService,
    mut cmd_rx: mpsc::Receiver<DeliveryCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut sequence = template.sequence;
    let mut lanes: HashMap<String, Lane> = HashMap::new();
    let mut lane_tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("delivery: shutting down");
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    DeliveryCommand::Send { content, host, port, reply } => {
                        sequence += 1;
                        let job = LaneJob {
                            sequence_no: sequence,
                            content,
                            port,
                            reply,
                        };
                        let lane = lanes
                            .entry(host.clone())
                            .or_insert_with(|| spawn_lane(&template, &host, &mut lane_tasks));
                        let rejected = lane.tx.send(job).err();
                        if let Some(mpsc::error::SendError(job)) = rejected {
                            tracing::warn!(%host, "delivery: lane gone, dropping it");
                            lanes.remove(&host);
                            let _ = job.reply.send(Err(DeliveryError::Stopped));
                        }
                    }
                    DeliveryCommand::ActiveConnections { reply } => {
                        let active = lanes
                            .values()
                            .filter(|lane| lane.connected.load(Ordering::Acquire))
                            .count();
                        let _ = reply.send(active);
                    }
                    DeliveryCommand::DisconnectAll { reply } => {
                        lanes.clear();
                        lane_tasks.shutdown().await;
                        tracing::debug!("delivery: all lanes closed");
                        let _ = reply.send(());
                    }
                }
            }
        }
    }

    lanes.clear();
    lane_tasks.shutdown().await;
}

fn spawn_lane(template: &DeliveryService, host: &str, tasks: &mut JoinSet<()>) -> Lane {
    let (tx, rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    tasks.spawn(run_lane(template.fresh(), host.to_string(), rx, connected.clone()));
    tracing::debug!(host, "delivery: lane opened");
    Lane { tx, connected }
}

/// Sends for one host, in order. Dropping the service closes its connection.
async fn run_lane(
    mut service: DeliveryService,
    host: String,
    mut rx: mpsc::UnboundedReceiver<LaneJob>,
    connected: Arc<AtomicBool>,
) {
    while let Some(job) = rx.recv().await {
        let result = service
            .send_numbered(job.sequence_no, &job.content, &host, job.port)
            .await;
        connected.store(service.active_connections() > 0, Ordering::Release);
        let _ = job.reply.send(result);
    }
}
