//! Segment reader
//!
//! Loads header, footer and index eagerly; reads blocks on demand. No file
//! handle is kept between reads, so open descriptors do not grow with the
//! number of segments.

use super::block::decode_block;
use super::format::*;
use crate::{Result, Sample, StorageError, Timestamp};
use bytes::Buf;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub struct SegmentReader {
    path: PathBuf,
    header: Header,
    index: HashMap<String, IndexEntry>,
}

impl SegmentReader {
    /// Open a segment file for reading
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(StorageError::CorruptedSegment(format!(
                "{}: file too short ({} bytes)",
                path.display(),
                file_len
            )));
        }

        let header = Self::read_header(&mut file)?;
        let footer = Self::read_footer(&mut file)?;

        let index_end = footer.index_offset + u64::from(footer.index_size);
        if footer.index_offset < HEADER_SIZE as u64 || index_end > file_len - FOOTER_SIZE as u64 {
            return Err(StorageError::CorruptedSegment(format!(
                "{}: index out of bounds",
                path.display()
            )));
        }

        let entries = Self::read_index(&mut file, &footer)?;
        if entries.len() != header.num_blocks as usize {
            return Err(StorageError::CorruptedSegment(format!(
                "{}: header declares {} blocks, index has {}",
                path.display(),
                header.num_blocks,
                entries.len()
            )));
        }

        let index = entries
            .into_iter()
            .map(|entry| (entry.metric.clone(), entry))
            .collect();

        Ok(SegmentReader {
            path,
            header,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn contains_metric(&self, metric: &str) -> bool {
        self.index.contains_key(metric)
    }

    /// Samples for `metric` with `start <= timestamp <= end`, in the order they were flushed
    pub fn query(&self, metric: &str, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        let entry = match self.index.get(metric) {
            Some(entry) if entry.overlaps(start, end) => entry,
            _ => return Ok(Vec::new()),
        };

        let samples = self.read_block(entry)?;

        Ok(samples
            .into_iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .collect())
    }

    /// Read header from file
    fn read_header(file: &mut File) -> Result<Header> {
        file.seek(SeekFrom::Start(0))?;

        let mut buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut buf)?;

        Header::decode(&buf)
    }

    /// Read footer from file (at the end)
    fn read_footer(file: &mut File) -> Result<Footer> {
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;

        let mut buf = vec![0u8; FOOTER_SIZE];
        file.read_exact(&mut buf)?;

        Footer::decode(&buf)
    }

    fn read_index(file: &mut File, footer: &Footer) -> Result<Vec<IndexEntry>> {
        file.seek(SeekFrom::Start(footer.index_offset))?;

        let mut buf = vec![0u8; footer.index_size as usize];
        file.read_exact(&mut buf)?;

        if crc32fast::hash(&buf) != footer.index_checksum {
            return Err(StorageError::CorruptedSegment(
                "Index checksum mismatch".into(),
            ));
        }

        let mut entries = Vec::new();
        let mut cursor = &buf[..];

        while cursor.has_remaining() {
            entries.push(IndexEntry::decode(&mut cursor)?);
        }

        Ok(entries)
    }

    fn read_block(&self, entry: &IndexEntry) -> Result<Vec<Sample>> {
        let mut stored = vec![0u8; entry.size as usize];
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        file.read_exact(&mut stored)?;

        let computed = crc32fast::hash(&stored);
        if computed != entry.checksum {
            return Err(StorageError::CorruptedSegment(format!(
                "{}: checksum mismatch in block {}: expected {}, got {}",
                self.path.display(),
                entry.metric,
                entry.checksum,
                computed
            )));
        }

        decode_block(&stored, self.header.is_compressed()).map_err(|e| {
            StorageError::CorruptedSegment(format!(
                "{}: block {}: {}",
                self.path.display(),
                entry.metric,
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::writer::SegmentWriter;
    use crate::wal::WalPosition;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_segment(path: &Path, compress: bool) -> Result<()> {
        let mut writer = SegmentWriter::new(path.to_path_buf(), compress)?;
        let cpu: Vec<_> = [3000, 1000, 2000, 5000]
            .iter()
            .map(|&ts| Sample::new("cpu", ts, ts as f64 / 10.0).with_tag("host", "a"))
            .collect();
        writer.add_metric("cpu", &cpu)?;
        writer.add_metric("mem", &[Sample::new("mem", 1000, 0.5)])?;
        writer.finish(WalPosition::default())?;
        Ok(())
    }

    #[test]
    fn test_reader_basic() -> Result<()> {
        let temp_dir = TempDir::new()?;

        for compress in [false, true] {
            let path = temp_dir.path().join(format!("segment-{}.seg", compress));
            write_segment(&path, compress)?;

            let reader = SegmentReader::open(path)?;
            assert_eq!(reader.header().sample_count, 5);
            assert!(reader.contains_metric("mem"));

            let cpu = reader.query("cpu", 0, 10_000)?;
            let timestamps: Vec<_> = cpu.iter().map(|s| s.timestamp).collect();
            assert_eq!(timestamps, vec![3000, 1000, 2000, 5000]);
            assert_eq!(cpu[0].tags.get("host").map(String::as_str), Some("a"));

            assert_eq!(reader.query("cpu", 1500, 3000)?.len(), 2);
            assert!(reader.query("cpu", 6000, 7000)?.is_empty());
            assert!(reader.query("disk", 0, 10_000)?.is_empty());
        }

        Ok(())
    }

    #[test]
    fn test_block_corruption_detected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("segment.seg");
        write_segment(&path, false)?;

        // Flip a byte inside the first block
        {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 10))?;
            file.write_all(&[0xAB])?;
        }

        let reader = SegmentReader::open(path)?;
        assert!(matches!(
            reader.query("cpu", 0, 10_000),
            Err(StorageError::CorruptedSegment(_))
        ));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_reader_holds_no_file_handle() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("segment.seg");
        write_segment(&path, true)?;

        let reader = SegmentReader::open(path.clone())?;
        assert_eq!(reader.query("cpu", 0, 10_000)?.len(), 4);

        // Blocks are read through a fresh handle each time
        std::fs::remove_file(&path)?;
        assert!(matches!(
            reader.query("cpu", 0, 10_000),
            Err(StorageError::Io(_))
        ));
        // Index lookups stay in memory
        assert!(reader.query("disk", 0, 10_000)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_truncated_file_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("segment.seg");
        write_segment(&path, false)?;

        let len = std::fs::metadata(&path)?.len();
        OpenOptions::new().write(true).open(&path)?.set_len(len - 8)?;

        assert!(SegmentReader::open(path).is_err());
        Ok(())
    }
}
