//! Length-delimited packet codec for TCP streams.
//!
//! Wire format: 4-byte big-endian length prefix + the packet's UTF-8 text.
//! A connection may carry any number of packets back to back. A
//! GET_FILE_DATA request is the exception: raw file bytes follow it with no
//! framing and the server closes when done.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::Packet;
use crate::ProtocolError;

/// Largest packet accepted on a stream (1 MB).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Frames `Packet` values over a byte stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Encode one packet into a standalone frame, for blocking writers.
    pub fn frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
        let mut dst = BytesMut::new();
        PacketCodec.encode(packet, &mut dst)?;
        Ok(dst.to_vec())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: length,
                max: MAX_PACKET_SIZE,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let bytes = src.split_to(length);
        Packet::from_bytes(&bytes).map(Some)
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = item.encode();
        if text.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: text.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + text.len());
        dst.put_u32(text.len() as u32);
        dst.extend_from_slice(text.as_bytes());
        Ok(())
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Packet>>::encode(self, &item, dst)
    }
}
