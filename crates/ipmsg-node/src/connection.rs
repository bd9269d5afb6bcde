//! Blocking TCP connection wrapper used by the delivery pool.
//!
//! Calls block the current thread; async callers run them on
//! `tokio::task::spawn_blocking`.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to create socket")]
    SocketCreationFailed,
    #[error("failed to connect to {host}:{port}")]
    ConnectionFailed { host: String, port: u16 },
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("send failed")]
    SendFailed,
    #[error("partial send")]
    PartialSend,
    #[error("receive failed")]
    ReceiveFailed,
}

/// One live stream to a host.
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Single write attempt. A short write is `PartialSend` and is not resumed.
    fn send(&self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Single read of at most `max_len` bytes.
    fn receive(&self, max_len: usize) -> Result<Vec<u8>, ConnectionError>;

    /// Idempotent.
    fn disconnect(&self);
}

pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>, ConnectionError>;
}

pub struct SocketConnection {
    host: String,
    port: u16,
    stream: TcpStream,
    connected: AtomicBool,
}

impl SocketConnection {
    /// Connect with a bounded wait, then hand back a blocking stream.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectionError> {
        let failed = || ConnectionError::ConnectionFailed {
            host: host.to_string(),
            port,
        };

        let addr = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
            .ok_or_else(failed)?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| ConnectionError::SocketCreationFailed)?;
        if let Err(e) = socket.connect_timeout(&addr.into(), timeout) {
            tracing::debug!(host, port, "tcp: connect failed: {e}");
            return Err(failed());
        }
        // connect_timeout leaves the socket in blocking mode
        let stream: TcpStream = socket.into();
        let _ = stream.set_nodelay(true);

        tracing::debug!(host, port, "tcp: connected");
        Ok(Self {
            host: host.to_string(),
            port,
            stream,
            connected: AtomicBool::new(true),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Connection for SocketConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, data: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::SendFailed);
        }
        match (&self.stream).write(data) {
            Ok(0) if !data.is_empty() => {
                self.connected.store(false, Ordering::Release);
                Err(ConnectionError::SendFailed)
            }
            Ok(n) if n < data.len() => Err(ConnectionError::PartialSend),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(host = %self.host, "tcp: write failed: {e}");
                self.connected.store(false, Ordering::Release);
                Err(ConnectionError::SendFailed)
            }
        }
    }

    fn receive(&self, max_len: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = vec![0u8; max_len];
        match (&self.stream).read(&mut buf) {
            Ok(0) => {
                self.connected.store(false, Ordering::Release);
                Err(ConnectionError::ConnectionClosed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                tracing::debug!(host = %self.host, "tcp: read failed: {e}");
                Err(ConnectionError::ReceiveFailed)
            }
        }
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
            tracing::debug!(host = %self.host, port = self.port, "tcp: disconnected");
        }
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Opens real TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>, ConnectionError> {
        let conn = SocketConnection::connect(host, port, self.connect_timeout)?;
        Ok(Arc::new(conn))
    }
}
