//! Datagram transport -- the seam between the discovery protocol and sockets.
//!
//! `UdpTransport` owns the real sockets: one listening socket on the protocol
//! port, ephemeral per-host sockets for unicast, and a broadcast socket.
//! `MockTransport` records every outbound datagram and lets tests inject
//! inbound ones, so the protocol tasks run without a network.
//!
//! Inbound traffic and listener state changes are delivered as
//! `TransportEvent`s on the channel handed to `start_listening`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};

use ipmsg_protocol::Packet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest datagram we accept.
const MAX_DATAGRAM_SIZE: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Ready,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A datagram arrived. `from_host` is the sender's IP address.
    Data { bytes: Vec<u8>, from_host: String },
    ListenerState(ListenerState),
    /// First datagram seen from a remote endpoint (diagnostics only).
    NewConnection(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind udp port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("send to {target} failed: {source}")]
    Send {
        target: String,
        source: std::io::Error,
    },
    #[error("simulated {0} failure")]
    Simulated(&'static str),
}

/// Datagram transport capability.
pub trait Transport: Send + 'static {
    /// Bind the listening socket and start delivering events to `events`.
    fn start_listening(&mut self, port: u16, events: EventSender) -> Result<(), TransportError>;

    /// Stop the listener and release per-host sockets. Safe when not listening.
    fn stop_listening(&mut self);

    /// Unicast `data` to `host:port`.
    fn send(
        &mut self,
        data: &[u8],
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Broadcast `data` to `port` on the local subnet.
    fn send_broadcast(
        &mut self,
        data: &[u8],
        port: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

// ============================================================================
// UDP sockets
// ============================================================================

pub struct UdpTransport {
    broadcast_addrs: Vec<Ipv4Addr>,
    listener: Option<JoinHandle<()>>,
    events: Option<EventSender>,
    peer_sockets: HashMap<String, UdpSocket>,
    broadcast_socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// `broadcast_addrs` are the subnet broadcast addresses to target;
    /// an empty list falls back to the limited broadcast address.
    pub fn new(broadcast_addrs: Vec<Ipv4Addr>) -> Self {
        let broadcast_addrs = if broadcast_addrs.is_empty() {
            vec![Ipv4Addr::BROADCAST]
        } else {
            broadcast_addrs
        };
        Self {
            broadcast_addrs,
            listener: None,
            events: None,
            peer_sockets: HashMap::new(),
            broadcast_socket: None,
        }
    }

    async fn peer_socket(&mut self, host: &str, port: u16) -> Result<&UdpSocket, TransportError> {
        if !self.peer_sockets.contains_key(host) {
            let target = tokio::net::lookup_host((host, port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
                .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}")))?;
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .await
                .map_err(|source| TransportError::Send {
                    target: target.to_string(),
                    source,
                })?;
            socket
                .connect(target)
                .await
                .map_err(|source| TransportError::Send {
                    target: target.to_string(),
                    source,
                })?;
            tracing::debug!(host, %target, "transport: opened unicast socket");
            self.peer_sockets.insert(host.to_string(), socket);
        }
        self.peer_sockets
            .get(host)
            .ok_or_else(|| TransportError::Resolve(host.to_string()))
    }

    fn broadcast_socket(&mut self) -> Result<&UdpSocket, TransportError> {
        if self.broadcast_socket.is_none() {
            let socket = bind_udp(0, true).map_err(|source| TransportError::Bind { port: 0, source })?;
            self.broadcast_socket = Some(socket);
        }
        self.broadcast_socket
            .as_ref()
            .ok_or(TransportError::Resolve("broadcast".into()))
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Bind a non-blocking UDP socket with address reuse and broadcast enabled.
fn bind_udp(port: u16, broadcast: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(broadcast)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

impl Transport for UdpTransport {
    fn start_listening(&mut self, port: u16, events: EventSender) -> Result<(), TransportError> {
        self.stop_listening();

        let socket = bind_udp(port, true).map_err(|source| TransportError::Bind { port, source })?;
        tracing::info!(port, "transport: listening");

        let task_events = events.clone();
        self.listener = Some(tokio::spawn(async move {
            run_receive_loop(socket, task_events).await;
        }));
        self.events = Some(events);
        Ok(())
    }

    fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            tracing::info!("transport: listener stopped");
        }
        if let Some(events) = self.events.take() {
            let _ = events.send(TransportEvent::ListenerState(ListenerState::Cancelled));
        }
        self.peer_sockets.clear();
        self.broadcast_socket = None;
    }

    async fn send(&mut self, data: &[u8], host: &str, port: u16) -> Result<(), TransportError> {
        let result = match self.peer_socket(host, port).await {
            Ok(socket) => socket.send(data).await.map(|_| ()).map_err(|source| {
                TransportError::Send {
                    target: format!("{host}:{port}"),
                    source,
                }
            }),
            Err(e) => Err(e),
        };
        if result.is_err() {
            // Drop the cached socket so the next send starts fresh
            self.peer_sockets.remove(host);
        }
        result
    }

    async fn send_broadcast(&mut self, data: &[u8], port: u16) -> Result<(), TransportError> {
        let targets: Vec<SocketAddr> = self
            .broadcast_addrs
            .iter()
            .map(|ip| SocketAddr::from((*ip, port)))
            .collect();
        let socket = self.broadcast_socket()?;

        let mut last_error = None;
        let mut delivered = 0usize;
        for target in targets {
            match socket.send_to(data, target).await {
                Ok(_) => delivered += 1,
                Err(source) => {
                    tracing::warn!(%target, "transport: broadcast failed: {source}");
                    last_error = Some(TransportError::Send {
                        target: target.to_string(),
                        source,
                    });
                }
            }
        }
        match (delivered, last_error) {
            (0, Some(e)) => {
                self.broadcast_socket = None;
                Err(e)
            }
            _ => Ok(()),
        }
    }
}

async fn run_receive_loop(socket: UdpSocket, events: EventSender) {
    if events
        .send(TransportEvent::ListenerState(ListenerState::Ready))
        .is_err()
    {
        return;
    }

    let mut seen: HashSet<SocketAddr> = HashSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if seen.insert(from) {
                    let _ = events.send(TransportEvent::NewConnection(from.to_string()));
                }
                let event = TransportEvent::Data {
                    bytes: buf[..n].to_vec(),
                    from_host: from.ip().to_string(),
                };
                if events.send(event).is_err() {
                    tracing::debug!("transport: event receiver dropped, stopping listener");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("transport: receive failed: {e}");
                let _ = events.send(TransportEvent::ListenerState(ListenerState::Failed(
                    e.to_string(),
                )));
                return;
            }
        }
    }
}

// ============================================================================
// In-memory double
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub data: Vec<u8>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastDatagram {
    pub data: Vec<u8>,
    pub port: u16,
}

#[derive(Default)]
struct MockState {
    listening_port: Option<u16>,
    events: Option<EventSender>,
    sent: Vec<SentDatagram>,
    broadcasts: Vec<BroadcastDatagram>,
    fail_on_send: bool,
    fail_on_listen: bool,
}

/// Deterministic transport double. Clones share state, so a test keeps one
/// clone for inspection and hands the other to the task under test.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inject an inbound datagram. Returns false when nothing is listening.
    pub fn simulate_receive(&self, data: impl Into<Vec<u8>>, from_host: &str) -> bool {
        let state = self.state();
        match (&state.events, state.listening_port) {
            (Some(events), Some(_)) => events
                .send(TransportEvent::Data {
                    bytes: data.into(),
                    from_host: from_host.to_string(),
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Inject an encoded packet as if `from_host` had sent it.
    pub fn simulate_packet(&self, packet: &Packet, from_host: &str) -> bool {
        self.simulate_receive(packet.to_bytes(), from_host)
    }

    pub fn simulate_new_connection(&self, endpoint: &str) -> bool {
        self.state()
            .events
            .as_ref()
            .is_some_and(|events| {
                events
                    .send(TransportEvent::NewConnection(endpoint.to_string()))
                    .is_ok()
            })
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.state().fail_on_send = fail;
    }

    pub fn set_fail_on_listen(&self, fail: bool) {
        self.state().fail_on_listen = fail;
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening_port.is_some()
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.state().listening_port
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state().sent.clone()
    }

    pub fn broadcasts(&self) -> Vec<BroadcastDatagram> {
        self.state().broadcasts.clone()
    }

    /// Broadcasts decoded as packets; undecodable datagrams are skipped.
    pub fn broadcast_packets(&self) -> Vec<Packet> {
        self.state()
            .broadcasts
            .iter()
            .filter_map(|b| Packet::from_bytes(&b.data).ok())
            .collect()
    }

    /// Unicasts decoded as packets; undecodable datagrams are skipped.
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.state()
            .sent
            .iter()
            .filter_map(|s| Packet::from_bytes(&s.data).ok())
            .collect()
    }

    /// Forget recorded traffic.
    pub fn clear(&self) {
        let mut state = self.state();
        state.sent.clear();
        state.broadcasts.clear();
    }
}

impl Transport for MockTransport {
    fn start_listening(&mut self, port: u16, events: EventSender) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_on_listen {
            return Err(TransportError::Simulated("listen"));
        }
        let _ = events.send(TransportEvent::ListenerState(ListenerState::Ready));
        state.listening_port = Some(port);
        state.events = Some(events);
        Ok(())
    }

    fn stop_listening(&mut self) {
        let mut state = self.state();
        state.listening_port = None;
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::ListenerState(ListenerState::Cancelled));
        }
    }

    async fn send(&mut self, data: &[u8], host: &str, port: u16) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_on_send {
            return Err(TransportError::Simulated("send"));
        }
        state.sent.push(SentDatagram {
            data: data.to_vec(),
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    async fn send_broadcast(&mut self, data: &[u8], port: u16) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_on_send {
            return Err(TransportError::Simulated("broadcast"));
        }
        state.broadcasts.push(BroadcastDatagram {
            data: data.to_vec(),
            port,
        });
        Ok(())
    }
}
