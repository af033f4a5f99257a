//! Segment file format constants and structures
//!
//! ```text
//! [Header 64B][block 0]...[block N-1][index][Footer 64B]
//! ```
//!
//! One block per metric. All integers are little-endian.

use crate::wal::WalPosition;
use crate::{Result, StorageError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};

/// Magic number to identify segment files (ASCII: "TSEG")
pub const MAGIC_NUMBER: u32 = 0x5453_4547;

/// Current format version
pub const VERSION: u32 = 1;

/// Size of header in bytes
pub const HEADER_SIZE: usize = 64;

/// Size of footer in bytes
pub const FOOTER_SIZE: usize = 64;

/// Header flag: blocks are Snappy-compressed
pub const FLAG_COMPRESSED: u32 = 1;

/// File header
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub num_blocks: u32,
    pub sample_count: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    /// WAL length at the moment this segment absorbed it
    pub wal_len: u64,
    /// CRC32 of those WAL bytes
    pub wal_checksum: u32,
}

impl Header {
    pub fn new(compressed: bool) -> Self {
        Header {
            magic: MAGIC_NUMBER,
            version: VERSION,
            flags: if compressed { FLAG_COMPRESSED } else { 0 },
            num_blocks: 0,
            sample_count: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
            wal_len: 0,
            wal_checksum: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// WAL position this segment absorbed
    pub fn wal_position(&self) -> WalPosition {
        WalPosition {
            len: self.wal_len,
            checksum: self.wal_checksum,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);

        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.num_blocks);
        buf.put_u64_le(self.sample_count);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u64_le(self.wal_len);
        buf.put_u32_le(self.wal_checksum);

        // Pad to HEADER_SIZE
        buf.resize(HEADER_SIZE, 0);

        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::CorruptedSegment("Header too short".into()));
        }

        let mut buf = data;

        let magic = buf.get_u32_le();
        if magic != MAGIC_NUMBER {
            return Err(StorageError::CorruptedSegment(format!(
                "Invalid magic number: {:x}",
                magic
            )));
        }

        let version = buf.get_u32_le();
        if version != VERSION {
            return Err(StorageError::CorruptedSegment(format!(
                "Unsupported version: {}",
                version
            )));
        }

        Ok(Header {
            magic,
            version,
            flags: buf.get_u32_le(),
            num_blocks: buf.get_u32_le(),
            sample_count: buf.get_u64_le(),
            min_timestamp: buf.get_i64_le(),
            max_timestamp: buf.get_i64_le(),
            wal_len: buf.get_u64_le(),
            wal_checksum: buf.get_u32_le(),
        })
    }
}

/// File footer
#[derive(Debug, Clone, PartialEq)]
pub struct Footer {
    pub index_offset: u64, // Where index block starts
    pub index_size: u32,   // Size of index block
    pub index_checksum: u32,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);

        buf.put_u64_le(self.index_offset);
        buf.put_u32_le(self.index_size);
        buf.put_u32_le(self.index_checksum);
        buf.put_u32_le(MAGIC_NUMBER);

        buf.resize(FOOTER_SIZE, 0);

        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(StorageError::CorruptedSegment("Footer too short".into()));
        }

        let mut buf = data;

        let index_offset = buf.get_u64_le();
        let index_size = buf.get_u32_le();
        let index_checksum = buf.get_u32_le();

        let magic = buf.get_u32_le();
        if magic != MAGIC_NUMBER {
            return Err(StorageError::CorruptedSegment(format!(
                "Invalid footer magic: {:x}",
                magic
            )));
        }

        Ok(Footer {
            index_offset,
            index_size,
            index_checksum,
        })
    }
}

/// Index entry (points to one metric's block)
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub metric: String,
    pub offset: u64,
    pub size: u32, // Stored (possibly compressed) size
    pub count: u32,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub checksum: u32, // CRC32 of the stored bytes
}

/// Fixed part of an index entry after the metric name
const INDEX_ENTRY_FIXED: usize = 8 + 4 + 4 + 8 + 8 + 4;

impl IndexEntry {
    /// Whether any sample in the block can fall in `[start, end]`
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        start <= end && self.min_timestamp <= end && self.max_timestamp >= start
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.metric.len() as u32);
        buf.put_slice(self.metric.as_bytes());

        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.count);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u32_le(self.checksum);
    }

    pub fn decode(data: &mut &[u8]) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(StorageError::CorruptedSegment(
                "Index entry too short".into(),
            ));
        }

        let metric_len = data.get_u32_le() as usize;

        if data.remaining() < metric_len + INDEX_ENTRY_FIXED {
            return Err(StorageError::CorruptedSegment(
                "Index entry truncated".into(),
            ));
        }

        let metric = std::str::from_utf8(&data[..metric_len])
            .map_err(|e| StorageError::CorruptedSegment(format!("Invalid metric name: {}", e)))?
            .to_string();
        data.advance(metric_len);

        Ok(IndexEntry {
            metric,
            offset: data.get_u64_le(),
            size: data.get_u32_le(),
            count: data.get_u32_le(),
            min_timestamp: data.get_i64_le(),
            max_timestamp: data.get_i64_le(),
            checksum: data.get_u32_le(),
        })
    }
}
