//! Colon-delimited packet codec.
//!
//! Wire format: `version:sequenceNo:sender:hostname:command:payload`.
//! The split stops after the fifth colon, so the payload may contain `:`.
//! There is no escaping: a colon inside `sender` or `hostname` shifts every
//! following field and the packet decodes to garbage or fails.

use crate::command::Command;
use crate::ProtocolError;

/// Number of colon-delimited fields in a packet.
const FIELD_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: i64,
    pub sequence_no: i64,
    pub sender_name: String,
    pub sender_host: String,
    pub command: Command,
    pub payload: String,
}

impl Packet {
    pub fn new(
        version: i64,
        sequence_no: i64,
        sender_name: impl Into<String>,
        sender_host: impl Into<String>,
        command: Command,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            version,
            sequence_no,
            sender_name: sender_name.into(),
            sender_host: sender_host.into(),
            command,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.version,
            self.sequence_no,
            self.sender_name,
            self.sender_host,
            self.command.code(),
            self.payload
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    pub fn decode(message: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = message.splitn(FIELD_COUNT, ':').collect();
        if parts.len() != FIELD_COUNT {
            return Err(ProtocolError::InvalidFormat(format!(
                "expected {FIELD_COUNT} fields, got {}",
                parts.len()
            )));
        }

        let version: i64 = parts[0]
            .parse()
            .map_err(|_| ProtocolError::InvalidFormat(format!("invalid version: {}", parts[0])))?;
        let sequence_no: i64 = parts[1].parse().map_err(|_| {
            ProtocolError::InvalidFormat(format!("invalid sequence number: {}", parts[1]))
        })?;
        let code: i64 = parts[4]
            .parse()
            .map_err(|_| ProtocolError::InvalidFormat(format!("invalid command: {}", parts[4])))?;
        let command = Command::try_from(code)?;

        Ok(Self {
            version,
            sequence_no,
            sender_name: parts[2].to_string(),
            sender_host: parts[3].to_string(),
            command,
            payload: parts[5].to_string(),
        })
    }

    /// Decode raw datagram bytes. Invalid UTF-8 is a format error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::InvalidFormat(format!("invalid utf-8: {e}")))?;
        Self::decode(text)
    }
}
