//! File transfer payloads: chunking, reassembly, offers and GETFILEDATA requests.
//!
//! File bytes move over a TCP stream with no per-chunk sequence number.
//! Reassembly is in arrival order, which is only correct because TCP
//! preserves ordering within one connection.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::file_meta::FileMetadata;
use crate::DEFAULT_BLOCK_SIZE;

/// Option flag marking a SENDMSG payload as a file offer.
pub const FILE_ATTACH_OPT: u32 = 0x0020_0000;

/// Separator between the text, flag and file list sections of an offer.
const OFFER_SECTION_DELIM: char = '\0';

/// Split `data[offset..]` into contiguous blocks of `block_size` bytes.
///
/// Returns no chunks when `offset` is at or past the end, so a saved offset
/// can be replayed to resume a transfer. A zero block size means the default.
pub fn chunk(data: &[u8], block_size: usize, offset: u64) -> Vec<&[u8]> {
    let size = if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    let start = match usize::try_from(offset) {
        Ok(start) if start < data.len() => start,
        _ => return Vec::new(),
    };
    data[start..].chunks(size).collect()
}

/// Receiving side of one transfer: accumulates chunks and tracks progress.
#[derive(Debug, Clone)]
pub struct FileReceiver {
    expected_size: i64,
    received_bytes: i64,
    chunks: Vec<Bytes>,
}

impl FileReceiver {
    /// `initial_offset` is the number of bytes already held from an earlier attempt.
    pub fn new(expected_size: i64, initial_offset: i64) -> Self {
        Self {
            expected_size,
            received_bytes: initial_offset,
            chunks: Vec::new(),
        }
    }

    pub fn append_chunk(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        self.received_bytes += data.len() as i64;
        self.chunks.push(data);
    }

    pub fn expected_size(&self) -> i64 {
        self.expected_size
    }

    pub fn received_bytes(&self) -> i64 {
        self.received_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes >= self.expected_size
    }

    /// Fraction received, 0 when the expected size is unknown.
    pub fn progress(&self) -> f64 {
        if self.expected_size <= 0 {
            return 0.0;
        }
        self.received_bytes as f64 / self.expected_size as f64
    }

    /// Concatenate chunks in the order they were received.
    pub fn assemble_data(&self) -> Bytes {
        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

/// Splits a raw file-data stream into chunks of at most `block_size` bytes,
/// stopping once `remaining` bytes have been yielded.
#[derive(Debug, Clone)]
pub struct FileChunkCodec {
    remaining: u64,
    block_size: usize,
}

impl FileChunkCodec {
    pub fn new(remaining: u64, block_size: usize) -> Self {
        let block_size = if block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        Self {
            remaining,
            block_size,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Decoder for FileChunkCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() || self.remaining == 0 {
            return Ok(None);
        }
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let take = src.len().min(self.block_size).min(remaining);
        self.remaining -= take as u64;
        Ok(Some(src.split_to(take).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let chunk = self.decode(src)?;
        if chunk.is_none() {
            // Bytes past the expected size are not file data
            src.clear();
        }
        Ok(chunk)
    }
}

/// GETFILEDATA request: `sequenceNo:fileID:offsetHex:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetFileData {
    /// Sequence number of the packet that carried the offer.
    pub sequence_no: i64,
    pub file_id: i64,
    pub offset: i64,
}

impl GetFileData {
    pub fn encode(&self) -> String {
        format!("{}:{}:{:x}:", self.sequence_no, self.file_id, self.offset.max(0))
    }

    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.split(':');
        let sequence_no = parts.next()?.parse().ok()?;
        let file_id = parts.next()?.parse().ok()?;
        let offset = i64::from_str_radix(parts.next()?, 16).ok()?;
        Some(Self {
            sequence_no,
            file_id,
            offset,
        })
    }
}

/// A file offer carried in a SENDMSG payload: `text NUL flagHex NUL fileList`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub text: String,
    pub files: Vec<FileMetadata>,
}

impl FileOffer {
    pub fn new(text: impl Into<String>, files: Vec<FileMetadata>) -> Self {
        Self {
            text: text.into(),
            files,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{text}{d}{flag:x}{d}{list}",
            text = self.text,
            d = OFFER_SECTION_DELIM,
            flag = FILE_ATTACH_OPT,
            list = FileMetadata::encode_list(&self.files),
        )
    }

    /// Returns `None` for plain messages (no attachment flag).
    pub fn parse(payload: &str) -> Option<Self> {
        let mut sections = payload.splitn(3, OFFER_SECTION_DELIM);
        let text = sections.next()?;
        let flags = u32::from_str_radix(sections.next()?, 16).ok()?;
        if flags & FILE_ATTACH_OPT == 0 {
            return None;
        }
        let files = FileMetadata::parse_list(sections.next().unwrap_or_default());
        Some(Self {
            text: text.to_string(),
            files,
        })
    }
}
