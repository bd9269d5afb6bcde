//! Discovery task -- owns the datagram transport, the peer map and packet numbering.
//!
//! All UDP traffic flows through this task. Presence, recall, typing and file
//! offers send their packets via `DiscoveryHandle` and learn about inbound
//! traffic from `DiscoveryEvent`s.
//!
//! Every outbound payload carries `NUL <instance-id>` so a node can recognise
//! its own broadcasts when the network loops them back.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use ipmsg_protocol::{Command, FileMetadata, FileOffer, Packet, PROTOCOL_VERSION};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::transport::{ListenerState, Transport, TransportError, TransportEvent};
use uuid::Uuid;

/// Separator between payload sections (offer sections, group, instance id).
const SECTION_DELIM: char = '\0';

/// Most recent inbound messages and recalls kept for snapshots.
const RECEIVED_LOG_CAPACITY: usize = 1024;

const COMMAND_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Sender name from the peer's packets. Stable across re-announcements.
    pub id: String,
    pub display_name: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub group: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub content: String,
    pub sender_name: String,
    pub hostname: String,
    pub from_address: String,
    pub sequence_no: i64,
    pub received_at: DateTime<Utc>,
    /// Files offered alongside the message; empty for plain text.
    pub attachments: Vec<FileMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallNotice {
    pub message_id: String,
    pub from: String,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStatus {
    pub listener_ready: bool,
    pub packets_received: u64,
    pub self_filtered: u64,
    pub malformed_dropped: u64,
    pub broadcasts_sent: u64,
    pub new_connections: u64,
    pub peer_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("discovery task has stopped")]
    TaskStopped,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerDiscovered(DiscoveredPeer),
    PeerUpdated(DiscoveredPeer),
    PeerLeft { peer_id: String },
    MessageReceived(ReceivedMessage),
    RecallReceived(RecallNotice),
    TypingReceived { from: String, to: String },
    StopTypingReceived { from: String, to: String },
    ListenerStateChanged(ListenerState),
}

/// Identity announced in every packet.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub nickname: String,
    pub hostname: String,
    pub group: Option<String>,
    pub port: u16,
}

impl DiscoveryConfig {
    pub fn from_node_config(cfg: &NodeConfig) -> Self {
        Self {
            nickname: cfg.node.nickname.clone(),
            hostname: cfg.node.hostname.clone(),
            group: cfg.node.group.clone(),
            port: cfg.network.port,
        }
    }
}

enum DiscoveryCommand {
    Start {
        reply: oneshot::Sender<Result<(), DiscoveryError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Refresh {
        reply: oneshot::Sender<Result<i64, DiscoveryError>>,
    },
    Broadcast {
        command: Command,
        payload: String,
        reply: oneshot::Sender<Result<i64, DiscoveryError>>,
    },
    SendTo {
        host: String,
        port: u16,
        command: Command,
        payload: String,
        reply: oneshot::Sender<Result<i64, DiscoveryError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<DiscoveredPeer>>,
    },
    ReceivedMessages {
        reply: oneshot::Sender<Vec<ReceivedMessage>>,
    },
    ReceivedRecalls {
        reply: oneshot::Sender<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<DiscoveryStatus>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to the discovery task.
#[derive(Clone)]
pub struct DiscoveryHandle {
    cmd_tx: mpsc::Sender<DiscoveryCommand>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    port: u16,
}

impl DiscoveryHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Protocol port peers listen on.
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> DiscoveryCommand,
    ) -> Result<R, DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| DiscoveryError::TaskStopped)?;
        rx.await.map_err(|_| DiscoveryError::TaskStopped)
    }

    /// Begin listening and announce ourselves.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        self.request(|reply| DiscoveryCommand::Start { reply }).await?
    }

    /// Announce exit, stop listening and forget every peer.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        self.request(|reply| DiscoveryCommand::Stop { reply }).await
    }

    /// Re-announce ourselves. Used as the presence heartbeat.
    pub async fn refresh(&self) -> Result<i64, DiscoveryError> {
        self.request(|reply| DiscoveryCommand::Refresh { reply }).await?
    }

    /// Broadcast a packet. Returns the sequence number it was sent with.
    pub async fn broadcast(
        &self,
        command: Command,
        payload: impl Into<String>,
    ) -> Result<i64, DiscoveryError> {
        let payload = payload.into();
        self.request(|reply| DiscoveryCommand::Broadcast {
            command,
            payload,
            reply,
        })
        .await?
    }

    /// Unicast a packet to `host` on the protocol port.
    pub async fn send_to(
        &self,
        host: impl Into<String>,
        command: Command,
        payload: impl Into<String>,
    ) -> Result<i64, DiscoveryError> {
        self.unicast(host.into(), self.port, command, payload.into())
            .await
    }

    /// Unicast a SEND_MESSAGE to a discovered peer.
    pub async fn send_direct(
        &self,
        peer: &DiscoveredPeer,
        payload: impl Into<String>,
    ) -> Result<i64, DiscoveryError> {
        self.unicast(peer.address.clone(), peer.port, Command::SendMessage, payload.into())
            .await
    }

    async fn unicast(
        &self,
        host: String,
        port: u16,
        command: Command,
        payload: String,
    ) -> Result<i64, DiscoveryError> {
        self.request(|reply| DiscoveryCommand::SendTo {
            host,
            port,
            command,
            payload,
            reply,
        })
        .await?
    }

    pub async fn peers(&self) -> Result<Vec<DiscoveredPeer>, DiscoveryError> {
        self.request(|reply| DiscoveryCommand::Peers { reply }).await
    }

    pub async fn received_messages(&self) -> Result<Vec<ReceivedMessage>, DiscoveryError> {
        self.request(|reply| DiscoveryCommand::ReceivedMessages { reply })
            .await
    }

    pub async fn received_recalls(&self) -> Result<Vec<String>, DiscoveryError> {
        self.request(|reply| DiscoveryCommand::ReceivedRecalls { reply })
            .await
    }

    pub async fn status(&self) -> Result<DiscoveryStatus, DiscoveryError> {
        self.request(|reply| DiscoveryCommand::Status { reply }).await
    }
}

/// Spawn the discovery task. It runs until shutdown or until every handle is dropped.
pub fn spawn_discovery<T: Transport>(
    transport: T,
    config: DiscoveryConfig,
    shutdown: broadcast::Receiver<()>,
) -> (DiscoveryHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
    let handle = DiscoveryHandle {
        cmd_tx,
        event_tx: event_tx.clone(),
        port: config.port,
    };
    let state = DiscoveryState::new(transport, config, event_tx);
    let task = tokio::spawn(run_discovery_loop(state, cmd_rx, shutdown));
    (handle, task)
}

// ============================================================================
// Task state
// ============================================================================

struct DiscoveryState<T> {
    transport: T,
    config: DiscoveryConfig,
    instance_id: String,
    sequence: i64,
    peers: HashMap<String, DiscoveredPeer>,
    received_messages: VecDeque<ReceivedMessage>,
    received_recalls: VecDeque<String>,
    status: DiscoveryStatus,
    listening: bool,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

async fn run_discovery_loop<T: Transport>(
    mut state: DiscoveryState<T>,
    mut cmd_rx: mpsc::Receiver<DiscoveryCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let Some(mut transport_rx) = state.transport_rx.take() else {
        return;
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::info!("discovery: shutting down");
                state.stop().await;
                break;
            }
            Some(event) = transport_rx.recv() => {
                state.handle_transport_event(event).await;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                state.handle_command(cmd).await;
            }
        }
    }
}

impl<T: Transport> DiscoveryState<T> {
    fn new(transport: T, config: DiscoveryConfig, event_tx: broadcast::Sender<DiscoveryEvent>) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            // Upper-case hyphenated, as other clients on the LAN write it
            instance_id: Uuid::new_v4().to_string().to_uppercase(),
            // Seeded from wall-clock time so numbers keep increasing across restarts
            sequence: Utc::now().timestamp(),
            peers: HashMap::new(),
            received_messages: VecDeque::new(),
            received_recalls: VecDeque::new(),
            status: DiscoveryStatus::default(),
            listening: false,
            event_tx,
            transport_tx,
            transport_rx: Some(transport_rx),
        }
    }

    async fn handle_command(&mut self, cmd: DiscoveryCommand) {
        match cmd {
            DiscoveryCommand::Start { reply } => {
                let _ = reply.send(self.start().await);
            }
            DiscoveryCommand::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            DiscoveryCommand::Refresh { reply } => {
                let payload = self.entry_payload();
                let _ = reply.send(self.broadcast(Command::EntryAnnounce, &payload).await);
            }
            DiscoveryCommand::Broadcast {
                command,
                payload,
                reply,
            } => {
                let _ = reply.send(self.broadcast(command, &payload).await);
            }
            DiscoveryCommand::SendTo {
                host,
                port,
                command,
                payload,
                reply,
            } => {
                let _ = reply.send(self.send_to(&host, port, command, &payload).await);
            }
            DiscoveryCommand::Peers { reply } => {
                let _ = reply.send(self.peers.values().cloned().collect());
            }
            DiscoveryCommand::ReceivedMessages { reply } => {
                let _ = reply.send(self.received_messages.iter().cloned().collect());
            }
            DiscoveryCommand::ReceivedRecalls { reply } => {
                let _ = reply.send(self.received_recalls.iter().cloned().collect());
            }
            DiscoveryCommand::Status { reply } => {
                let mut status = self.status.clone();
                status.peer_count = self.peers.len();
                let _ = reply.send(status);
            }
        }
    }

    async fn start(&mut self) -> Result<(), DiscoveryError> {
        if !self.listening {
            self.transport
                .start_listening(self.config.port, self.transport_tx.clone())?;
            self.listening = true;
            tracing::info!(
                port = self.config.port,
                nickname = %self.config.nickname,
                instance = %self.instance_id,
                "discovery: started"
            );
        }
        let payload = self.entry_payload();
        self.broadcast(Command::EntryAnnounce, &payload).await?;
        Ok(())
    }

    async fn stop(&mut self) {
        if self.listening {
            if let Err(e) = self.broadcast(Command::ExitAnnounce, "").await {
                tracing::warn!("discovery: exit announce failed: {e}");
            }
            self.transport.stop_listening();
            self.listening = false;
        }
        let forgotten = self.peers.len();
        self.peers.clear();
        tracing::info!(forgotten, "discovery: stopped");
    }

    fn entry_payload(&self) -> String {
        match &self.config.group {
            Some(group) => format!("{}{SECTION_DELIM}{group}", self.config.nickname),
            None => self.config.nickname.clone(),
        }
    }

    fn next_packet(&mut self, command: Command, payload: &str) -> Packet {
        self.sequence += 1;
        Packet::new(
            PROTOCOL_VERSION,
            self.sequence,
            self.config.nickname.clone(),
            self.config.hostname.clone(),
            command,
            format!("{payload}{SECTION_DELIM}{}", self.instance_id),
        )
    }

    async fn broadcast(&mut self, command: Command, payload: &str) -> Result<i64, DiscoveryError> {
        let packet = self.next_packet(command, payload);
        self.transport
            .send_broadcast(&packet.to_bytes(), self.config.port)
            .await?;
        self.status.broadcasts_sent += 1;
        tracing::debug!(command = command.name(), seq = packet.sequence_no, "discovery: broadcast sent");
        Ok(packet.sequence_no)
    }

    async fn send_to(
        &mut self,
        host: &str,
        port: u16,
        command: Command,
        payload: &str,
    ) -> Result<i64, DiscoveryError> {
        let packet = self.next_packet(command, payload);
        self.transport.send(&packet.to_bytes(), host, port).await?;
        tracing::debug!(host, command = command.name(), seq = packet.sequence_no, "discovery: unicast sent");
        Ok(packet.sequence_no)
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data { bytes, from_host } => self.handle_datagram(&bytes, &from_host).await,
            TransportEvent::ListenerState(state) => {
                match &state {
                    ListenerState::Ready => tracing::info!("discovery: listener ready"),
                    ListenerState::Failed(reason) => tracing::warn!(%reason, "discovery: listener failed"),
                    ListenerState::Cancelled => tracing::debug!("discovery: listener cancelled"),
                }
                self.status.listener_ready = state == ListenerState::Ready;
                self.emit(DiscoveryEvent::ListenerStateChanged(state));
            }
            TransportEvent::NewConnection(endpoint) => {
                self.status.new_connections += 1;
                tracing::debug!(%endpoint, "discovery: first datagram from endpoint");
            }
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from_host: &str) {
        self.status.packets_received += 1;
        if bytes.is_empty() {
            self.status.malformed_dropped += 1;
            tracing::debug!(from = from_host, "discovery: empty datagram dropped");
            return;
        }
        let mut packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.status.malformed_dropped += 1;
                tracing::debug!(from = from_host, "discovery: undecodable datagram dropped: {e}");
                return;
            }
        };

        let (content, instance) = split_instance_id(&packet.payload);
        if instance == Some(self.instance_id.as_str()) {
            self.status.self_filtered += 1;
            tracing::trace!(seq = packet.sequence_no, "discovery: own packet filtered");
            return;
        }
        packet.payload = content.to_string();

        match packet.command {
            Command::EntryAnnounce | Command::EntryAck => self.handle_entry(&packet, from_host).await,
            Command::ExitAnnounce => self.handle_exit(&packet),
            Command::SendMessage => self.handle_message(packet, from_host).await,
            Command::RecallMessage => {
                tracing::info!(message_id = %packet.payload, from = %packet.sender_name, "discovery: recall received");
                push_bounded(&mut self.received_recalls, packet.payload.clone());
                self.emit(DiscoveryEvent::RecallReceived(RecallNotice {
                    message_id: packet.payload,
                    from: packet.sender_name,
                }));
            }
            Command::Typing => self.emit(DiscoveryEvent::TypingReceived {
                from: packet.sender_name,
                to: packet.payload,
            }),
            Command::StopTyping => self.emit(DiscoveryEvent::StopTypingReceived {
                from: packet.sender_name,
                to: packet.payload,
            }),
            other => {
                tracing::debug!(command = other.name(), from = from_host, "discovery: command ignored");
            }
        }
    }

    async fn handle_entry(&mut self, packet: &Packet, from_host: &str) {
        let (display_name, group) = match packet.payload.split_once(SECTION_DELIM) {
            Some((name, group)) => (name, Some(group.to_string()).filter(|g| !g.is_empty())),
            None => (packet.payload.as_str(), None),
        };
        let display_name = if display_name.is_empty() {
            packet.sender_name.clone()
        } else {
            display_name.to_string()
        };

        match self.peers.get_mut(&packet.sender_name) {
            Some(peer) => {
                peer.display_name = display_name;
                peer.hostname = packet.sender_host.clone();
                peer.address = from_host.to_string();
                peer.port = self.config.port;
                if group.is_some() {
                    peer.group = group;
                }
                tracing::debug!(peer = %peer.id, address = %peer.address, "discovery: peer refreshed");
                let peer = peer.clone();
                self.emit(DiscoveryEvent::PeerUpdated(peer));
            }
            None => {
                let peer = DiscoveredPeer {
                    id: packet.sender_name.clone(),
                    display_name,
                    hostname: packet.sender_host.clone(),
                    address: from_host.to_string(),
                    port: self.config.port,
                    group,
                    discovered_at: Utc::now(),
                };
                tracing::info!(peer = %peer.id, address = %peer.address, "discovery: peer added");
                self.peers.insert(peer.id.clone(), peer.clone());
                self.emit(DiscoveryEvent::PeerDiscovered(peer));
            }
        }

        // Every listener acknowledges a newcomer, not just the first responder
        if packet.command == Command::EntryAnnounce {
            let payload = self.entry_payload();
            if let Err(e) = self.broadcast(Command::EntryAck, &payload).await {
                tracing::warn!(peer = %packet.sender_name, "discovery: entry ack failed: {e}");
            }
        }
    }

    fn handle_exit(&mut self, packet: &Packet) {
        if self.peers.remove(&packet.sender_name).is_some() {
            tracing::info!(peer = %packet.sender_name, "discovery: peer left");
            self.emit(DiscoveryEvent::PeerLeft {
                peer_id: packet.sender_name.clone(),
            });
        }
    }

    async fn handle_message(&mut self, packet: Packet, from_host: &str) {
        let (content, attachments) = match FileOffer::parse(&packet.payload) {
            Some(offer) => (offer.text, offer.files),
            None => (packet.payload.clone(), Vec::new()),
        };
        let message = ReceivedMessage {
            content,
            sender_name: packet.sender_name.clone(),
            hostname: packet.sender_host.clone(),
            from_address: from_host.to_string(),
            sequence_no: packet.sequence_no,
            received_at: Utc::now(),
            attachments,
        };
        tracing::info!(
            from = %message.sender_name,
            seq = message.sequence_no,
            attachments = message.attachments.len(),
            "discovery: message received"
        );
        push_bounded(&mut self.received_messages, message.clone());
        self.emit(DiscoveryEvent::MessageReceived(message));

        let ack = packet.sequence_no.to_string();
        if let Err(e) = self.broadcast(Command::MessageAck, &ack).await {
            tracing::warn!(seq = packet.sequence_no, "discovery: message ack failed: {e}");
        }
    }
}

/// Append, dropping the oldest entry once the log is full.
fn push_bounded<T>(log: &mut VecDeque<T>, item: T) {
    if log.len() == RECEIVED_LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(item);
}

/// Split a trailing `NUL <instance-id>` off a payload.
///
/// Only a final section that parses as a UUID (hyphenated or 32 bare hex
/// digits) counts as an instance id, so payloads from peers that do not
/// append one keep their own NUL sections.
fn split_instance_id(payload: &str) -> (&str, Option<&str>) {
    match payload.rsplit_once(SECTION_DELIM) {
        Some((content, id)) if is_instance_id(id) => (content, Some(id)),
        _ => (payload, None),
    }
}

fn is_instance_id(section: &str) -> bool {
    matches!(section.len(), 32 | 36) && Uuid::try_parse(section).is_ok()
}
