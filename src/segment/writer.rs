//! Segment writer
//!
//! Writes one flushed MemTable to an immutable file. Content goes to a
//! `.tmp` sibling first; [`SegmentWriter::finish`] syncs it and renames it
//! into place, so a segment file either exists completely or not at all.
//!
//! ```ignore
//! let mut writer = SegmentWriter::new(path, true)?;
//! writer.add_metric("cpu", &samples)?;
//! let header = writer.finish(wal.position())?;
//! ```

use super::block::BlockBuilder;
use super::format::{Footer, Header, IndexEntry, HEADER_SIZE};
use crate::wal::WalPosition;
use crate::{Result, Sample, StorageError};
use bytes::BytesMut;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    tmp_path: PathBuf,
    block_builder: BlockBuilder,
    index_entries: Vec<IndexEntry>,
    offset: u64,
    header: Header,
}

impl SegmentWriter {
    pub fn new(path: PathBuf, compress: bool) -> Result<Self> {
        let tmp_path = temp_path(&path);
        let mut file = File::create(&tmp_path)?;

        // Placeholder; the real header is written by finish()
        file.write_all(&[0u8; HEADER_SIZE])?;

        Ok(SegmentWriter {
            file,
            path,
            tmp_path,
            block_builder: BlockBuilder::new(),
            index_entries: Vec::new(),
            offset: HEADER_SIZE as u64,
            header: Header::new(compress),
        })
    }

    /// Write every sample of one metric as a single block.
    /// Each metric may be added at most once.
    pub fn add_metric(&mut self, metric: &str, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if self.index_entries.iter().any(|e| e.metric == metric) {
            return Err(StorageError::EncodeFailed(format!(
                "Metric {} already written to segment",
                metric
            )));
        }

        self.block_builder.reset();
        for sample in samples {
            self.block_builder.add(sample)?;
        }

        let stored = self.block_builder.finish(self.header.is_compressed())?;
        if stored.len() > u32::MAX as usize {
            return Err(StorageError::EncodeFailed(format!(
                "Block for {} too large",
                metric
            )));
        }
        self.file.write_all(&stored)?;

        self.index_entries.push(IndexEntry {
            metric: metric.to_string(),
            offset: self.offset,
            size: stored.len() as u32,
            count: self.block_builder.count(),
            min_timestamp: self.block_builder.min_timestamp(),
            max_timestamp: self.block_builder.max_timestamp(),
            checksum: crc32fast::hash(&stored),
        });

        self.offset += stored.len() as u64;
        self.header.num_blocks += 1;
        self.header.sample_count += u64::from(self.block_builder.count());
        self.header.min_timestamp = self.header.min_timestamp.min(self.block_builder.min_timestamp());
        self.header.max_timestamp = self.header.max_timestamp.max(self.block_builder.max_timestamp());

        Ok(())
    }

    /// Write index, footer and header, sync, and move the file into place
    pub fn finish(mut self, wal: WalPosition) -> Result<Header> {
        let mut index = BytesMut::new();
        for entry in &self.index_entries {
            entry.encode(&mut index);
        }
        if index.len() > u32::MAX as usize {
            return Err(StorageError::EncodeFailed("Segment index too large".into()));
        }

        let footer = Footer {
            index_offset: self.offset,
            index_size: index.len() as u32,
            index_checksum: crc32fast::hash(&index),
        };
        self.file.write_all(&index)?;
        self.file.write_all(&footer.encode())?;

        self.header.wal_len = wal.len;
        self.header.wal_checksum = wal.checksum;

        // Go back to beginning and write header
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;

        // Ensure everything is written before the rename makes it visible
        self.file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        sync_dir(&self.path)?;

        Ok(self.header)
    }
}

/// `segment-00000001.seg` -> `segment-00000001.seg.tmp`
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Persist a rename by syncing the parent directory
#[cfg(unix)]
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
