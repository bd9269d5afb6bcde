//! File attachment list carried in a file offer.
//!
//! Each entry: `fileID BEL name:sizeHex:mtimeHex:attrHex: BEL`.
//! Parsing is tolerant: a segment that is not an integer file ID is skipped
//! and parsing resumes at the next segment.

use chrono::{DateTime, TimeZone, Utc};

/// Separator between (fileID, info) segments.
pub const FILE_LIST_DELIM: char = '\u{07}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAttribute {
    Regular,
    Directory,
    Symlink,
    Clipboard,
}

impl FileAttribute {
    pub const fn code(self) -> u32 {
        match self {
            FileAttribute::Regular => 0x0000_0001,
            FileAttribute::Directory => 0x0000_0002,
            FileAttribute::Symlink => 0x0000_0004,
            FileAttribute::Clipboard => 0x0000_0020,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0000_0001 => Some(FileAttribute::Regular),
            0x0000_0002 => Some(FileAttribute::Directory),
            0x0000_0004 => Some(FileAttribute::Symlink),
            0x0000_0020 => Some(FileAttribute::Clipboard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub mod_time: DateTime<Utc>,
    pub attribute: FileAttribute,
}

impl FileMetadata {
    pub fn new(
        file_id: i64,
        file_name: impl Into<String>,
        file_size: i64,
        mod_time: DateTime<Utc>,
        attribute: FileAttribute,
    ) -> Self {
        Self {
            file_id,
            file_name: file_name.into(),
            file_size,
            mod_time,
            attribute,
        }
    }

    /// Encode one list entry, including both delimiters. Negative sizes and
    /// pre-epoch times are written as 0, which is what the hex fields can hold.
    pub fn encode_entry(&self) -> String {
        format!(
            "{id}{d}{name}:{size:x}:{mtime:x}:{attr:x}:{d}",
            id = self.file_id,
            d = FILE_LIST_DELIM,
            name = self.file_name,
            size = self.file_size.max(0),
            mtime = self.mod_time.timestamp().max(0),
            attr = self.attribute.code(),
        )
    }

    pub fn encode_list(files: &[FileMetadata]) -> String {
        files.iter().map(FileMetadata::encode_entry).collect()
    }

    /// Parse every well-formed entry in `payload`.
    pub fn parse_list(payload: &str) -> Vec<FileMetadata> {
        let segments: Vec<&str> = payload
            .split(FILE_LIST_DELIM)
            .filter(|s| !s.is_empty())
            .collect();

        let mut out = Vec::new();
        let mut i = 0;
        while i < segments.len() {
            match (segments[i].parse::<i64>(), segments.get(i + 1)) {
                (Ok(file_id), Some(info)) => {
                    match parse_info(file_id, info) {
                        Some(meta) => out.push(meta),
                        None => tracing::debug!(file_id, info = %info, "file list: malformed entry skipped"),
                    }
                    i += 2;
                }
                _ => {
                    tracing::trace!(segment = segments[i], "file list: non-id segment skipped");
                    i += 1;
                }
            }
        }
        out
    }
}

fn parse_info(file_id: i64, info: &str) -> Option<FileMetadata> {
    let parts: Vec<&str> = info.split(':').collect();
    if parts.len() < 4 {
        return None;
    }

    let file_size = i64::from_str_radix(parts[1], 16).unwrap_or(0);
    let mod_time = i64::from_str_radix(parts[2], 16)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);
    let attribute = u32::from_str_radix(parts[3], 16)
        .ok()
        .and_then(FileAttribute::from_code)
        .unwrap_or(FileAttribute::Regular);

    Some(FileMetadata {
        file_id,
        file_name: parts[0].to_string(),
        file_size,
        mod_time,
        attribute,
    })
}
