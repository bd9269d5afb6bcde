//! TCP side of the protocol: file data, releases and direct messages.
//!
//! Offers are announced over UDP (a SEND_MESSAGE carrying the attachment
//! flag). The receiver then opens a TCP connection per file, sends one
//! GET_FILE_DATA packet and reads raw bytes until the file is complete or
//! the server closes. The same listener accepts SEND_MESSAGE packets from
//! `DeliveryService` peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use ipmsg_protocol::{
    chunk, Command, FileAttribute, FileChunkCodec, FileMetadata, FileOffer, FileReceiver,
    GetFileData, Packet, PacketCodec, ProtocolError, PROTOCOL_VERSION,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::config::NodeConfig;
use crate::discovery::{DiscoveredPeer, DiscoveryError, DiscoveryHandle, ReceivedMessage};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connect to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },
    #[error("transfer ended early: {received} of {expected} bytes")]
    Incomplete { received: i64, expected: i64 },
    #[error("file {file_id} is not part of the offer")]
    UnknownFile { file_id: i64 },
    #[error("offer announcement failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("file server has stopped")]
    ServerStopped,
}

// ============================================================================
// Server
// ============================================================================

/// A file we are prepared to serve.
#[derive(Debug, Clone)]
pub struct OfferedFile {
    pub metadata: FileMetadata,
    pub path: PathBuf,
}

impl OfferedFile {
    /// Describe a local file. `file_id` is its index within the offer.
    pub async fn from_path(file_id: i64, path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        let mod_time: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        let attribute = if meta.is_dir() {
            FileAttribute::Directory
        } else {
            FileAttribute::Regular
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            metadata: FileMetadata::new(file_id, file_name, meta.len() as i64, mod_time, attribute),
            path,
        })
    }
}

#[derive(Debug, Clone)]
pub enum FileServerEvent {
    /// A SEND_MESSAGE arrived over TCP.
    MessageReceived(ReceivedMessage),
    TransferServed {
        sequence_no: i64,
        file_id: i64,
        bytes: u64,
    },
    OfferReleased {
        sequence_no: i64,
    },
}

enum FileServerCommand {
    Offer {
        sequence_no: i64,
        files: Vec<OfferedFile>,
    },
    Release {
        sequence_no: i64,
    },
    Lookup {
        sequence_no: i64,
        file_id: i64,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    OfferCount {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct FileServerHandle {
    cmd_tx: mpsc::Sender<FileServerCommand>,
    event_tx: broadcast::Sender<FileServerEvent>,
    local_addr: SocketAddr,
}

impl FileServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileServerEvent> {
        self.event_tx.subscribe()
    }

    /// Make `files` downloadable under the sequence number of the offer packet.
    pub async fn offer(&self, sequence_no: i64, files: Vec<OfferedFile>) -> Result<(), TransferError> {
        self.cmd_tx
            .send(FileServerCommand::Offer { sequence_no, files })
            .await
            .map_err(|_| TransferError::ServerStopped)
    }

    pub async fn release(&self, sequence_no: i64) -> Result<(), TransferError> {
        self.cmd_tx
            .send(FileServerCommand::Release { sequence_no })
            .await
            .map_err(|_| TransferError::ServerStopped)
    }

    pub async fn offer_count(&self) -> Result<usize, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(FileServerCommand::OfferCount { reply })
            .await
            .map_err(|_| TransferError::ServerStopped)?;
        rx.await.map_err(|_| TransferError::ServerStopped)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileServerConfig {
    pub block_size: usize,
    pub receive_buffer: usize,
}

impl FileServerConfig {
    pub fn from_node_config(cfg: &NodeConfig) -> Self {
        let params = cfg.params();
        Self {
            block_size: params.block_size,
            receive_buffer: params.receive_buffer,
        }
    }
}

/// Bind the TCP listener and start serving.
pub async fn spawn_file_server(
    bind: SocketAddr,
    config: FileServerConfig,
    shutdown: broadcast::Receiver<()>,
) -> Result<(FileServerHandle, JoinHandle<()>), TransferError> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "transfer: tcp listening");

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);
    let handle = FileServerHandle {
        cmd_tx: cmd_tx.clone(),
        event_tx: event_tx.clone(),
        local_addr,
    };
    let task = tokio::spawn(run_file_server(listener, config, cmd_tx, cmd_rx, event_tx, shutdown));
    Ok((handle, task))
}

async fn run_file_server(
    listener: TcpListener,
    config: FileServerConfig,
    cmd_tx: mpsc::Sender<FileServerCommand>,
    mut cmd_rx: mpsc::Receiver<FileServerCommand>,
    event_tx: broadcast::Sender<FileServerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut offers: HashMap<i64, Vec<OfferedFile>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("transfer: shutting down");
                break;
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, from)) => {
                        let cmd_tx = cmd_tx.clone();
                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, from, config, cmd_tx, event_tx).await {
                                tracing::debug!(%from, "transfer: connection failed: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("transfer: accept error: {e}"),
                }
            }
            cmd = cmd_rx.recv() => {
                // The task holds a sender itself, so this never yields None
                let Some(cmd) = cmd else { break };
                match cmd {
                    FileServerCommand::Offer { sequence_no, files } => {
                        tracing::info!(seq = sequence_no, files = files.len(), "transfer: files offered");
                        offers.insert(sequence_no, files);
                    }
                    FileServerCommand::Release { sequence_no } => {
                        if offers.remove(&sequence_no).is_some() {
                            tracing::info!(seq = sequence_no, "transfer: offer released");
                            let _ = event_tx.send(FileServerEvent::OfferReleased { sequence_no });
                        }
                    }
                    FileServerCommand::Lookup { sequence_no, file_id, reply } => {
                        let path = offers
                            .get(&sequence_no)
                            .and_then(|files| files.iter().find(|f| f.metadata.file_id == file_id))
                            .map(|f| f.path.clone());
                        let _ = reply.send(path);
                    }
                    FileServerCommand::OfferCount { reply } => {
                        let _ = reply.send(offers.len());
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    from: SocketAddr,
    config: FileServerConfig,
    cmd_tx: mpsc::Sender<FileServerCommand>,
    event_tx: broadcast::Sender<FileServerEvent>,
) -> Result<(), TransferError> {
    let (reader, mut writer) = stream.into_split();
    let mut packets = FramedRead::with_capacity(reader, PacketCodec, config.receive_buffer);

    while let Some(packet) = packets.next().await {
        let packet = packet?;
        match packet.command {
            Command::GetFileData => {
                serve_file(&mut writer, from, &packet, config, &cmd_tx, &event_tx).await?;
                // Raw file bytes end the conversation
                return Ok(());
            }
            Command::ReleaseFiles => {
                let sequence_no = packet.payload.trim_end_matches(':').parse().map_err(|_| {
                    ProtocolError::InvalidFormat(format!("bad RELEASEFILES payload: {}", packet.payload))
                })?;
                cmd_tx
                    .send(FileServerCommand::Release { sequence_no })
                    .await
                    .map_err(|_| TransferError::ServerStopped)?;
            }
            Command::SendMessage => {
                let (content, attachments) = match FileOffer::parse(&packet.payload) {
                    Some(offer) => (offer.text, offer.files),
                    None => (packet.payload.clone(), Vec::new()),
                };
                let message = ReceivedMessage {
                    content,
                    sender_name: packet.sender_name,
                    hostname: packet.sender_host,
                    from_address: from.ip().to_string(),
                    sequence_no: packet.sequence_no,
                    received_at: Utc::now(),
                    attachments,
                };
                tracing::info!(from = %message.sender_name, seq = message.sequence_no, "transfer: tcp message received");
                let _ = event_tx.send(FileServerEvent::MessageReceived(message));
            }
            other => {
                tracing::debug!(%from, command = other.name(), "transfer: unexpected tcp command");
            }
        }
    }
    tracing::debug!(%from, "transfer: connection closed");
    Ok(())
}

async fn serve_file(
    writer: &mut OwnedWriteHalf,
    from: SocketAddr,
    packet: &Packet,
    config: FileServerConfig,
    cmd_tx: &mpsc::Sender<FileServerCommand>,
    event_tx: &broadcast::Sender<FileServerEvent>,
) -> Result<(), TransferError> {
    let request = GetFileData::parse(&packet.payload).ok_or_else(|| {
        ProtocolError::InvalidFormat(format!("bad GETFILEDATA payload: {}", packet.payload))
    })?;
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(FileServerCommand::Lookup {
            sequence_no: request.sequence_no,
            file_id: request.file_id,
            reply,
        })
        .await
        .map_err(|_| TransferError::ServerStopped)?;
    let path = rx
        .await
        .map_err(|_| TransferError::ServerStopped)?
        .ok_or(TransferError::UnknownFile {
            file_id: request.file_id,
        })?;

    let data = tokio::fs::read(&path).await?;
    let offset = u64::try_from(request.offset).unwrap_or(0);
    let mut sent = 0u64;
    for block in chunk(&data, config.block_size, offset) {
        writer.write_all(block).await?;
        sent += block.len() as u64;
    }
    writer.shutdown().await?;
    tracing::info!(%from, seq = request.sequence_no, file_id = request.file_id, offset, bytes = sent, "transfer: file served");
    let _ = event_tx.send(FileServerEvent::TransferServed {
        sequence_no: request.sequence_no,
        file_id: request.file_id,
        bytes: sent,
    });
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

/// Issues GET_FILE_DATA requests. Shareable; each request takes the next
/// sequence number.
pub struct FileClient {
    sender_name: String,
    sender_host: String,
    sequence: AtomicI64,
    connect_timeout: Duration,
    block_size: usize,
}

impl FileClient {
    pub fn new(
        sender_name: impl Into<String>,
        sender_host: impl Into<String>,
        connect_timeout: Duration,
        block_size: usize,
    ) -> Self {
        Self {
            sender_name: sender_name.into(),
            sender_host: sender_host.into(),
            sequence: AtomicI64::new(0),
            connect_timeout,
            block_size,
        }
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fetch `expected_size` bytes of a file starting at `request.offset`.
    ///
    /// The receiver counts the offset as already held, so `is_complete`
    /// reflects the whole file. Ends early with `Incomplete` if the server
    /// closes first.
    pub async fn fetch(
        &self,
        host: &str,
        port: u16,
        request: GetFileData,
        expected_size: i64,
    ) -> Result<FileReceiver, TransferError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransferError::ConnectTimeout {
                host: host.to_string(),
                port,
            })??;

        let packet = Packet::new(
            PROTOCOL_VERSION,
            self.next_sequence(),
            self.sender_name.clone(),
            self.sender_host.clone(),
            Command::GetFileData,
            request.encode(),
        );
        stream.write_all(&PacketCodec::frame(&packet)?).await?;

        let mut receiver = FileReceiver::new(expected_size, request.offset);
        let remaining = u64::try_from(expected_size - request.offset).unwrap_or(0);
        let mut frames = FramedRead::new(stream, FileChunkCodec::new(remaining, self.block_size));
        while !receiver.is_complete() {
            match frames.next().await {
                Some(block) => receiver.append_chunk(block?),
                None => break,
            }
        }

        if !receiver.is_complete() {
            return Err(TransferError::Incomplete {
                received: receiver.received_bytes(),
                expected: expected_size,
            });
        }
        tracing::debug!(host, file_id = request.file_id, chunks = receiver.chunk_count(), "transfer: file fetched");
        Ok(receiver)
    }

    /// Tell the offering host it can forget an offer.
    pub async fn release(&self, host: &str, port: u16, sequence_no: i64) -> Result<(), TransferError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransferError::ConnectTimeout {
                host: host.to_string(),
                port,
            })??;
        let packet = Packet::new(
            PROTOCOL_VERSION,
            self.next_sequence(),
            self.sender_name.clone(),
            self.sender_host.clone(),
            Command::ReleaseFiles,
            sequence_no.to_string(),
        );
        stream.write_all(&PacketCodec::frame(&packet)?).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Service
// ============================================================================

/// Offers local files to peers and downloads files offered to us.
pub struct FileTransferService {
    discovery: DiscoveryHandle,
    server: FileServerHandle,
    client: FileClient,
    tcp_port: u16,
}

impl FileTransferService {
    pub fn new(discovery: DiscoveryHandle, server: FileServerHandle, client: FileClient, tcp_port: u16) -> Self {
        Self {
            discovery,
            server,
            client,
            tcp_port,
        }
    }

    /// Announce `paths` to `peer` and make them downloadable.
    /// Returns the offer's sequence number.
    pub async fn offer_files(
        &self,
        peer: &DiscoveredPeer,
        text: &str,
        paths: &[PathBuf],
    ) -> Result<i64, TransferError> {
        let mut files = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            files.push(OfferedFile::from_path(i as i64, path.clone()).await?);
        }
        let offer = FileOffer::new(text, files.iter().map(|f| f.metadata.clone()).collect());
        let sequence_no = self.discovery.send_direct(peer, offer.encode()).await?;
        self.server.offer(sequence_no, files).await?;
        tracing::info!(peer = %peer.id, seq = sequence_no, files = paths.len(), "transfer: offer sent");
        Ok(sequence_no)
    }

    /// Download one attachment of `message` into `dest`, resuming from the
    /// length of any partial file already there.
    pub async fn download(
        &self,
        message: &ReceivedMessage,
        file_id: i64,
        dest: &Path,
    ) -> Result<u64, TransferError> {
        let file = message
            .attachments
            .iter()
            .find(|f| f.file_id == file_id)
            .ok_or(TransferError::UnknownFile { file_id })?;

        let existing = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len() as i64,
            Err(_) => 0,
        };
        let offset = existing.min(file.file_size);
        let request = GetFileData {
            sequence_no: message.sequence_no,
            file_id,
            offset,
        };
        let receiver = self
            .client
            .fetch(&message.from_address, self.tcp_port, request, file.file_size)
            .await?;

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dest)
            .await?;
        let data = receiver.assemble_data();
        out.write_all(&data).await?;
        out.flush().await?;
        tracing::info!(file = %file.file_name, offset, bytes = data.len(), "transfer: download complete");
        Ok(data.len() as u64)
    }

    pub fn server(&self) -> &FileServerHandle {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{spawn_discovery, DiscoveryConfig};
    use crate::transport::MockTransport;

    fn config() -> FileServerConfig {
        FileServerConfig {
            block_size: 1024,
            receive_buffer: 4096,
        }
    }

    async fn server() -> (FileServerHandle, broadcast::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (handle, _task) = spawn_file_server("127.0.0.1:0".parse().unwrap(), config(), shutdown_rx)
            .await
            .unwrap();
        (handle, shutdown_tx)
    }

    fn client() -> FileClient {
        FileClient::new("bob", "bob-host", Duration::from_secs(5), 1024)
    }

    async fn offered_file(dir: &Path, data: &[u8]) -> OfferedFile {
        let path = dir.join("payload.bin");
        tokio::fs::write(&path, data).await.unwrap();
        OfferedFile::from_path(0, path).await.unwrap()
    }

    #[tokio::test]
    async fn test_offered_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = offered_file(dir.path(), &[1u8; 300]).await;
        assert_eq!(file.metadata.file_name, "payload.bin");
        assert_eq!(file.metadata.file_size, 300);
        assert_eq!(file.metadata.attribute, FileAttribute::Regular);
    }

    #[tokio::test]
    async fn test_fetch_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (server, _tx) = server().await;
        server.offer(77, vec![offered_file(dir.path(), &data).await]).await.unwrap();

        let port = server.local_addr().port();
        let rx = client()
            .fetch(
                "127.0.0.1",
                port,
                GetFileData {
                    sequence_no: 77,
                    file_id: 0,
                    offset: 0,
                },
                data.len() as i64,
            )
            .await
            .unwrap();
        assert!(rx.is_complete());
        assert_eq!(rx.assemble_data(), data);
    }

    #[tokio::test]
    async fn test_fetch_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 7) as u8).collect();
        let (server, _tx) = server().await;
        server.offer(5, vec![offered_file(dir.path(), &data).await]).await.unwrap();

        let rx = client()
            .fetch(
                "127.0.0.1",
                server.local_addr().port(),
                GetFileData {
                    sequence_no: 5,
                    file_id: 0,
                    offset: 2048,
                },
                3000,
            )
            .await
            .unwrap();
        assert_eq!(rx.received_bytes(), 3000);
        assert_eq!(rx.assemble_data(), &data[2048..]);
    }

    #[tokio::test]
    async fn test_unknown_file_is_incomplete() {
        let (server, _tx) = server().await;
        let err = client()
            .fetch(
                "127.0.0.1",
                server.local_addr().port(),
                GetFileData {
                    sequence_no: 1,
                    file_id: 9,
                    offset: 0,
                },
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Incomplete { received: 0, expected: 10 }));
    }

    #[tokio::test]
    async fn test_release_forgets_offer() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _tx) = server().await;
        let mut events = server.subscribe();
        server.offer(12, vec![offered_file(dir.path(), b"x").await]).await.unwrap();
        assert_eq!(server.offer_count().await.unwrap(), 1);

        client()
            .release("127.0.0.1", server.local_addr().port(), 12)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, FileServerEvent::OfferReleased { sequence_no: 12 }));
        assert_eq!(server.offer_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tcp_message_forwarded_as_event() {
        let (server, _tx) = server().await;
        let mut events = server.subscribe();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let packet = Packet::new(1, 9, "carol", "carol-host", Command::SendMessage, "over tcp");
        stream.write_all(&PacketCodec::frame(&packet).unwrap()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            FileServerEvent::MessageReceived(m) => {
                assert_eq!(m.content, "over tcp");
                assert_eq!(m.sender_name, "carol");
                assert_eq!(m.sequence_no, 9);
                assert_eq!(m.from_address, "127.0.0.1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn next_message(events: &mut broadcast::Receiver<FileServerEvent>) -> ReceivedMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let FileServerEvent::MessageReceived(m) = event {
                return m;
            }
        }
    }

    #[tokio::test]
    async fn test_one_connection_carries_many_messages() {
        let (server, _tx) = server().await;
        let mut events = server.subscribe();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let long = "y".repeat(10_000);
        let mut frames = Vec::new();
        for (seq, body) in [(1, "first"), (2, long.as_str()), (3, "third")] {
            let packet = Packet::new(1, seq, "carol", "carol-host", Command::SendMessage, body);
            frames.extend(PacketCodec::frame(&packet).unwrap());
        }
        // Back to back in one write, then idle on the same stream
        stream.write_all(&frames).await.unwrap();

        assert_eq!(next_message(&mut events).await.content, "first");
        let second = next_message(&mut events).await;
        assert_eq!(second.content.len(), 10_000);
        assert_eq!(second.sequence_no, 2);
        assert_eq!(next_message(&mut events).await.content, "third");

        let packet = Packet::new(1, 4, "carol", "carol-host", Command::SendMessage, "later");
        stream.write_all(&PacketCodec::frame(&packet).unwrap()).await.unwrap();
        assert_eq!(next_message(&mut events).await.content, "later");
    }

    async fn service(
        server: &FileServerHandle,
    ) -> (FileTransferService, MockTransport, broadcast::Sender<()>) {
        let mock = MockTransport::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (discovery, _task) = spawn_discovery(
            mock.clone(),
            DiscoveryConfig {
                nickname: "alice".into(),
                hostname: "alice-host".into(),
                group: None,
                port: 2425,
            },
            shutdown_rx,
        );
        let port = server.local_addr().port();
        let svc = FileTransferService::new(discovery, server.clone(), client(), port);
        (svc, mock, shutdown_tx)
    }

    #[tokio::test]
    async fn test_offer_files_announces_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let (server, _tx) = server().await;
        let (svc, mock, _stx) = service(&server).await;
        let peer = DiscoveredPeer {
            id: "bob".into(),
            display_name: "Bob".into(),
            hostname: "bob-host".into(),
            address: "10.0.0.2".into(),
            port: 2425,
            group: None,
            discovered_at: Utc::now(),
        };

        let seq = svc.offer_files(&peer, "for you", &[path]).await.unwrap();
        assert_eq!(svc.server().offer_count().await.unwrap(), 1);

        let sent = mock.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, Command::SendMessage);
        assert_eq!(sent[0].sequence_no, seq);
        let (payload, _) = sent[0].payload.rsplit_once('\0').unwrap();
        let offer = FileOffer::parse(payload).unwrap();
        assert_eq!(offer.text, "for you");
        assert_eq!(offer.files[0].file_name, "a.txt");
        assert_eq!(offer.files[0].file_size, 5);
    }

    #[tokio::test]
    async fn test_download_resumes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 13) as u8).collect();
        let (server, _tx) = server().await;
        let file = offered_file(dir.path(), &data).await;
        let metadata = file.metadata.clone();
        server.offer(21, vec![file]).await.unwrap();

        let dest = dir.path().join("download.bin");
        tokio::fs::write(&dest, &data[..1500]).await.unwrap();

        let (svc, _mock, _stx) = service(&server).await;
        let message = ReceivedMessage {
            content: String::new(),
            sender_name: "bob".into(),
            hostname: "bob-host".into(),
            from_address: "127.0.0.1".into(),
            sequence_no: 21,
            received_at: Utc::now(),
            attachments: vec![metadata],
        };

        let fetched = svc.download(&message, 0, &dest).await.unwrap();
        assert_eq!(fetched, 2500);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);

        assert!(matches!(
            svc.download(&message, 3, &dest).await,
            Err(TransferError::UnknownFile { file_id: 3 })
        ));
    }
}
