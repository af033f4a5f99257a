//! Block builder and decoder for segment data blocks
//!
//! A block holds one metric's samples in arrival order, framed exactly like
//! WAL records, optionally compressed with raw Snappy.

use crate::wal::{decode_frames, encode_frame};
use crate::{Result, Sample, StorageError, Timestamp};
use bytes::BytesMut;

pub struct BlockBuilder {
    buffer: BytesMut,
    count: u32,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl BlockBuilder {
    pub fn new() -> Self {
        BlockBuilder {
            buffer: BytesMut::new(),
            count: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
        }
    }

    pub fn add(&mut self, sample: &Sample) -> Result<()> {
        if self.count == u32::MAX {
            return Err(StorageError::EncodeFailed("Block sample count overflow".into()));
        }

        encode_frame(sample, &mut self.buffer)?;

        self.min_timestamp = self.min_timestamp.min(sample.timestamp);
        self.max_timestamp = self.max_timestamp.max(sample.timestamp);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    /// Uncompressed size in bytes
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Finish building and return the bytes to store
    pub fn finish(&self, compress: bool) -> Result<Vec<u8>> {
        if !compress {
            return Ok(self.buffer.to_vec());
        }

        snap::raw::Encoder::new()
            .compress_vec(&self.buffer)
            .map_err(|e| StorageError::EncodeFailed(format!("Compression failed: {}", e)))
    }

    /// Reset for reuse
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.count = 0;
        self.min_timestamp = Timestamp::MAX;
        self.max_timestamp = Timestamp::MIN;
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode stored block bytes back into samples
pub fn decode_block(data: &[u8], compressed: bool) -> Result<Vec<Sample>> {
    if !compressed {
        return decode_frames(data);
    }

    let decompressed = snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| StorageError::CorruptedSegment(format!("Snappy decompression failed: {}", e)))?;

    decode_frames(&decompressed)
}
