//! IPMsg Protocol -- wire packet, command set, file-transfer payloads.
//!
//! UDP broadcast for presence and signalling, TCP for message delivery and file data.
//! Packets are UTF-8 text: `version:sequenceNo:sender:hostname:command:payload`.

pub mod codec;
pub mod command;
pub mod file_meta;
pub mod packet;
pub mod params;
pub mod transfer;

pub use codec::{PacketCodec, MAX_PACKET_SIZE};
pub use command::Command;
pub use file_meta::{FileAttribute, FileMetadata, FILE_LIST_DELIM};
pub use packet::Packet;
pub use params::{ProtocolParams, CURRENT_PARAMS, DEFAULT_PARAMS};
pub use transfer::{
    chunk, FileChunkCodec, FileOffer, FileReceiver, GetFileData, FILE_ATTACH_OPT,
};

/// Protocol version written in the first packet field.
pub const PROTOCOL_VERSION: i64 = 1;

/// Default UDP (and TCP) port of the protocol.
pub const DEFAULT_PORT: u16 = 2425;

/// Heartbeat broadcast interval in seconds (sourced from default params).
pub const HEARTBEAT_INTERVAL_SECS: u64 = DEFAULT_PARAMS.heartbeat_interval_secs;

/// Missed timeout checks before a peer is evicted (sourced from default params).
pub const HEARTBEAT_MISS_LIMIT: u32 = DEFAULT_PARAMS.heartbeat_miss_limit;

/// Default file block size in bytes (sourced from default params).
pub const DEFAULT_BLOCK_SIZE: usize = DEFAULT_PARAMS.block_size;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid packet format: {0}")]
    InvalidFormat(String),
    #[error("invalid command code: {0}")]
    InvalidCommand(i64),
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },
    #[error("stream error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}
