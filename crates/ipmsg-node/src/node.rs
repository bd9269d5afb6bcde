//! Node wiring -- starts every service and routes events between them.
//!
//! Discovery owns UDP. Presence heartbeats are discovery refreshes. Inbound
//! recall and typing packets are routed to their services. Peers and
//! messages land in the `ContactStore`. Every service runs in a task of its
//! own; the node only holds handles.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::delivery::{spawn_delivery, DeliveryError, DeliveryHandle, DeliveryService};
use crate::discovery::{
    spawn_discovery, DiscoveredPeer, DiscoveryConfig, DiscoveryEvent, DiscoveryHandle,
    ReceivedMessage,
};
use crate::file_transfer::{
    spawn_file_server, FileClient, FileServerConfig, FileServerEvent, FileTransferService,
    TransferError,
};
use crate::presence::{broadcast_fn, spawn_presence, PresenceConfig, PresenceEvent, PresenceHandle};
use crate::recall::{spawn_recall, RecallError, RecallHandle, RecallService, RECALL_CLEANUP_INTERVAL};
use crate::store::ContactStore;
use crate::transport::{Transport, UdpTransport};
use crate::typing::{spawn_typing, TypingConfig, TypingHandle};

/// A running node. Dropping it without `shutdown` leaves the tasks running
/// until the runtime stops.
pub struct Node {
    config: NodeConfig,
    discovery: DiscoveryHandle,
    presence: PresenceHandle,
    typing: TypingHandle,
    recall: RecallHandle,
    delivery: DeliveryHandle,
    files: FileTransferService,
    store: Arc<dyn ContactStore>,
    tcp_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start on real sockets.
    pub async fn start(config: NodeConfig, store: Arc<dyn ContactStore>) -> anyhow::Result<Self> {
        let transport = UdpTransport::new(config.network.broadcast_addrs.clone());
        let delivery = DeliveryService::from_config(&config);
        Self::start_with(config, transport, delivery, store).await
    }

    /// Start with an injected datagram transport and delivery service.
    pub async fn start_with<T: Transport>(
        config: NodeConfig,
        transport: T,
        delivery: DeliveryService,
        store: Arc<dyn ContactStore>,
    ) -> anyhow::Result<Self> {
        tracing::info!(
            nickname = %config.node.nickname,
            hostname = %config.node.hostname,
            udp_port = config.network.port,
            tcp_port = config.network.tcp_port,
            version = env!("CARGO_PKG_VERSION"),
            "starting ipmsg-node"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = Vec::new();

        let (discovery, task) = spawn_discovery(
            transport,
            DiscoveryConfig::from_node_config(&config),
            shutdown_tx.subscribe(),
        );
        tasks.push(task);
        // Subscribe before start so the first announcements are not missed
        let discovery_rx = discovery.subscribe();
        discovery.start().await?;

        let (presence, task) = spawn_presence(
            PresenceConfig::from_node_config(&config),
            shutdown_tx.subscribe(),
        );
        tasks.push(task);
        let presence_rx = presence.subscribe();
        let refresher = discovery.clone();
        presence
            .start(broadcast_fn(move || {
                let discovery = refresher.clone();
                async move {
                    if let Err(e) = discovery.refresh().await {
                        tracing::warn!("node: heartbeat broadcast failed: {e}");
                    }
                }
            }))
            .await?;

        let (typing, task) = spawn_typing(
            discovery.clone(),
            TypingConfig::from_node_config(&config),
            shutdown_tx.subscribe(),
        );
        tasks.push(task);

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.network.tcp_port));
        let (server, task) = spawn_file_server(
            bind,
            FileServerConfig::from_node_config(&config),
            shutdown_tx.subscribe(),
        )
        .await?;
        tasks.push(task);
        let tcp_addr = server.local_addr();
        let files_rx = server.subscribe();

        let params = config.params();
        let client = FileClient::new(
            config.node.nickname.clone(),
            config.node.hostname.clone(),
            Duration::from_secs(params.connect_timeout_secs),
            params.block_size,
        );
        let files = FileTransferService::new(discovery.clone(), server, client, config.network.tcp_port);

        let (recall, task) = spawn_recall(
            RecallService::from_config(discovery.clone(), &config),
            RECALL_CLEANUP_INTERVAL,
            shutdown_tx.subscribe(),
        );
        tasks.push(task);

        let (delivery, task) = spawn_delivery(delivery, shutdown_tx.subscribe());
        tasks.push(task);

        let router = EventRouter {
            nickname: config.node.nickname.clone(),
            udp_port: config.network.port,
            presence: presence.clone(),
            typing: typing.clone(),
            recall: recall.clone(),
            store: store.clone(),
        };
        tasks.push(tokio::spawn(run_event_loop(
            router,
            discovery_rx,
            files_rx,
            presence_rx,
            shutdown_tx.subscribe(),
        )));

        tracing::info!(%tcp_addr, "node: all tasks spawned");
        Ok(Self {
            config,
            discovery,
            presence,
            typing,
            recall,
            delivery,
            files,
            store,
            tcp_addr,
            shutdown_tx,
            tasks,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoveryHandle {
        &self.discovery
    }

    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    pub fn typing(&self) -> &TypingHandle {
        &self.typing
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Address of the TCP listener (messages and file data).
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Deliver a chat message to `peer` over TCP.
    pub async fn send_message(&self, peer: &DiscoveredPeer, content: &str) -> Result<i64, DeliveryError> {
        self.delivery
            .send_message(content, &peer.address, self.config.network.tcp_port)
            .await
    }

    /// Recall one of our own messages. The sender is always us.
    pub async fn recall_message(
        &self,
        message_id: &str,
        sender_id: &str,
        message_ts: DateTime<Utc>,
        is_recalled: bool,
    ) -> Result<(), RecallError> {
        self.recall
            .recall_message(message_id, sender_id, &self.config.node.nickname, message_ts, is_recalled)
            .await
    }

    pub async fn is_recalled(&self, message_id: &str) -> bool {
        self.recall.is_recalled(message_id).await.unwrap_or(false)
    }

    /// Pooled TCP connections currently open to peers.
    pub async fn active_connections(&self) -> usize {
        self.delivery.active_connections().await.unwrap_or(0)
    }

    pub async fn offer_files(
        &self,
        peer: &DiscoveredPeer,
        text: &str,
        paths: &[PathBuf],
    ) -> Result<i64, TransferError> {
        self.files.offer_files(peer, text, paths).await
    }

    pub async fn download(
        &self,
        message: &ReceivedMessage,
        file_id: i64,
        dest: &Path,
    ) -> Result<u64, TransferError> {
        self.files.download(message, file_id, dest).await
    }

    /// Stop presence, announce exit, then stop every task.
    pub async fn shutdown(self) {
        tracing::info!("node: shutting down");
        if let Err(e) = self.presence.stop().await {
            tracing::debug!("node: presence stop: {e}");
        }
        if let Err(e) = self.discovery.stop().await {
            tracing::debug!("node: discovery stop: {e}");
        }
        if let Err(e) = self.delivery.disconnect_all().await {
            tracing::debug!("node: delivery disconnect: {e}");
        }
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("node: shutdown complete");
    }
}

struct EventRouter {
    nickname: String,
    udp_port: u16,
    presence: PresenceHandle,
    typing: TypingHandle,
    recall: RecallHandle,
    store: Arc<dyn ContactStore>,
}

impl EventRouter {
    async fn on_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerDiscovered(peer) | DiscoveryEvent::PeerUpdated(peer) => {
                let _ = self.presence.record_heartbeat(peer.id.clone()).await;
                if let Err(e) = self.store.find_or_create_user(
                    &peer.hostname,
                    &peer.display_name,
                    &peer.address,
                    peer.port,
                    peer.group.as_deref(),
                ) {
                    tracing::warn!(peer = %peer.id, "node: store user failed: {e}");
                }
            }
            DiscoveryEvent::PeerLeft { peer_id } => {
                tracing::info!(peer = %peer_id, "node: peer left");
            }
            DiscoveryEvent::MessageReceived(message) => {
                let _ = self.presence.record_heartbeat(message.sender_name.clone()).await;
                self.store_message(&message);
            }
            DiscoveryEvent::RecallReceived(notice) => {
                if let Err(e) = self
                    .recall
                    .handle_recall_command(&notice.message_id, &notice.from)
                    .await
                {
                    tracing::debug!("node: recall routing failed: {e}");
                }
            }
            DiscoveryEvent::TypingReceived { from, to } => {
                if to == self.nickname {
                    let _ = self.typing.handle_typing_command(from).await;
                }
            }
            DiscoveryEvent::StopTypingReceived { from, to } => {
                if to == self.nickname {
                    let _ = self.typing.handle_stop_typing_command(from).await;
                }
            }
            DiscoveryEvent::ListenerStateChanged(state) => {
                tracing::info!(?state, "node: udp listener state");
            }
        }
    }

    fn on_file_server(&self, event: FileServerEvent) {
        match event {
            FileServerEvent::MessageReceived(message) => self.store_message(&message),
            FileServerEvent::TransferServed { sequence_no, file_id, bytes } => {
                tracing::debug!(seq = sequence_no, file_id, bytes, "node: transfer served");
            }
            FileServerEvent::OfferReleased { sequence_no } => {
                tracing::debug!(seq = sequence_no, "node: offer released");
            }
        }
    }

    fn store_message(&self, message: &ReceivedMessage) {
        let result = self
            .store
            .find_or_create_conversation(
                &message.hostname,
                &message.sender_name,
                &message.from_address,
                self.udp_port,
                None,
            )
            .and_then(|(conversation, _)| self.store.append_message(conversation, message));
        if let Err(e) = result {
            tracing::warn!(from = %message.sender_name, "node: store message failed: {e}");
        }
    }
}

async fn run_event_loop(
    router: EventRouter,
    mut discovery_rx: broadcast::Receiver<DiscoveryEvent>,
    mut files_rx: broadcast::Receiver<FileServerEvent>,
    mut presence_rx: broadcast::Receiver<PresenceEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("node: event loop shutting down");
                break;
            }
            event = discovery_rx.recv() => {
                match event {
                    Ok(event) => router.on_discovery(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("node: discovery events lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = files_rx.recv() => {
                match event {
                    Ok(event) => router.on_file_server(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("node: transfer events lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = presence_rx.recv() => {
                match event {
                    Ok(PresenceEvent::PeerExpired { peer_id }) => {
                        tracing::info!(peer = %peer_id, "node: peer went offline");
                    }
                    Ok(PresenceEvent::PeerOnline { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("node: presence events lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
