// rust/ptfu-core/src/cache/entry.rs

//! Disk cache entry format.
//!
//! Every decoded record is stored as:
//! ```text
//! +-------------------+
//! | Header length     |  <- u32, little endian
//! +-------------------+
//! | Header (bincode)  |  <- EntryHeader serialized with bincode
//! +-------------------+
//! | Compressed Data   |  <- bincode Record compressed according to header
//! +-------------------+
//! ```

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{DatasetError, Result};

/// Header of a disk cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Magic bytes identifying a cache entry ("PTFC")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Record name, checked on read to rule out key collisions
    pub name: String,
    /// Compression algorithm used ("none", "lz4", or "zstd")
    pub compression: String,
    /// Size of the data before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed data
    pub checksum: u64,
}

impl EntryHeader {
    pub const MAGIC: [u8; 4] = *b"PTFC";
    pub const VERSION: u32 = 1;

    pub fn new(name: &str, compression: &str, uncompressed_size: u64, checksum: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            name: name.to_string(),
            compression: compression.to_string(),
            uncompressed_size,
            checksum,
        }
    }
}

/// XXHash64 of `data` with seed 0.
pub fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn compress(data: &[u8], compression: &str, level: i32) -> Result<Vec<u8>> {
    match compression {
        "none" => Ok(data.to_vec()),
        "lz4" => Ok(lz4_flex::compress_prepend_size(data)),
        "zstd" => zstd::encode_all(data, level)
            .map_err(|e| DatasetError::serialization(format!("zstd compression failed: {e}"))),
        _ => Err(DatasetError::serialization(format!(
            "unknown compression algorithm: {compression}"
        ))),
    }
}

fn decompress(data: &[u8], compression: &str) -> Result<Vec<u8>> {
    match compression {
        "none" => Ok(data.to_vec()),
        "lz4" => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| DatasetError::serialization(format!("lz4 decompression failed: {e}"))),
        "zstd" => zstd::decode_all(data)
            .map_err(|e| DatasetError::serialization(format!("zstd decompression failed: {e}"))),
        _ => Err(DatasetError::serialization(format!(
            "unknown compression algorithm: {compression}"
        ))),
    }
}

/// Frames `body` under `name` with header, checksum and compression.
pub fn encode(name: &str, body: &[u8], compression: &str, level: i32) -> Result<Vec<u8>> {
    let compressed = compress(body, compression, level)?;
    let header = EntryHeader::new(name, compression, body.len() as u64, checksum(body));
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| DatasetError::serialization(format!("failed to serialize header: {e}")))?;

    let header_len = header_bytes.len() as u32;
    let mut out = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Verifies and unframes an entry, returning its header and body.
pub fn decode(data: &[u8]) -> Result<(EntryHeader, Vec<u8>)> {
    let Some(len_bytes) = data.get(..4) else {
        return Err(DatasetError::serialization("cache entry too small"));
    };
    let header_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
        as usize;
    let Some(header_bytes) = data.get(4..4 + header_len) else {
        return Err(DatasetError::serialization(
            "cache entry truncated: header incomplete",
        ));
    };

    let header: EntryHeader = bincode::deserialize(header_bytes)
        .map_err(|e| DatasetError::serialization(format!("failed to deserialize header: {e}")))?;

    if header.magic != EntryHeader::MAGIC {
        return Err(DatasetError::serialization(format!(
            "invalid magic bytes: expected {:?}, got {:?}",
            EntryHeader::MAGIC,
            header.magic
        )));
    }
    if header.version != EntryHeader::VERSION {
        return Err(DatasetError::serialization(format!(
            "unsupported version: expected {}, got {}",
            EntryHeader::VERSION,
            header.version
        )));
    }

    let body = decompress(&data[4 + header_len..], &header.compression)?;

    let computed = checksum(&body);
    if computed != header.checksum {
        return Err(DatasetError::serialization(format!(
            "checksum mismatch: expected {}, got {}",
            header.checksum, computed
        )));
    }
    if body.len() as u64 != header.uncompressed_size {
        return Err(DatasetError::serialization(format!(
            "size mismatch: expected {}, got {}",
            header.uncompressed_size,
            body.len()
        )));
    }

    Ok((header, body))
}
