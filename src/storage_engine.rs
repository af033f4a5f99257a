use crate::checkpoint;
use crate::config::StorageConfig;
use crate::segment::{self, SegmentReader, SegmentWriter};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::wal::{Wal, WalPosition};
use crate::{MemTable, Result, Sample, StorageError, Timestamp};
use parking_lot::RwLock;
use std::fs;
use tracing::{debug, info};

/// Time-series storage engine
///
/// Writes go to the WAL (when enabled) and then the MemTable. A full
/// MemTable is flushed inline into a new immutable segment. One lock guards
/// MemTable, WAL and segments together: writes and flushes are exclusive,
/// queries are shared.
pub struct StorageEngine {
    config: StorageConfig,
    state: RwLock<EngineState>,
    stats: EngineStats,
}

struct EngineState {
    memtable: MemTable,
    wal: Option<Wal>,
    segments: Vec<SegmentReader>,
    next_segment_id: u64,
    /// Newest segment whose WAL generation is known to be truncated
    checkpoint: u64,
    closed: bool,
}

impl StorageEngine {
    /// Open the engine, loading existing segments and replaying the WAL
    /// before returning.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.data_dir).map_err(|source| {
            StorageError::DirectoryCreationFailed {
                path: config.data_dir.clone(),
                source,
            }
        })?;

        segment::remove_temp_files(&config.data_dir)?;

        let mut segments = Vec::new();
        let mut next_segment_id = 1;
        for (id, path) in segment::list_segments(&config.data_dir)? {
            segments.push(SegmentReader::open(path)?);
            next_segment_id = id + 1;
        }

        let stats = EngineStats::new();
        let mut memtable = MemTable::new(config.max_memory_mb);
        let newest_segment = next_segment_id - 1;
        let mut checkpoint_id = 0;

        let wal = if config.wal_enabled {
            checkpoint_id = checkpoint::read(&config.data_dir)?;

            let wal = Wal::open(&config.wal_path)?;
            let recovery = Wal::recover_with_policy(&config.wal_path, config.wal_recovery)?;
            wal.resume(&recovery)?;

            // Frames already persisted by a segment whose WAL generation was
            // never truncated: a crash or truncate failure after its commit
            let absorbed = segments
                .last()
                .filter(|_| newest_segment > checkpoint_id)
                .and_then(|newest| recovery.frames_through(newest.header().wal_position()))
                .unwrap_or(0);

            if absorbed > 0 {
                info!(
                    wal = %config.wal_path.display(),
                    segment = newest_segment,
                    frames = absorbed,
                    "WAL frames already persisted in newest segment, skipping them"
                );
            }

            if absorbed == recovery.samples.len() {
                if absorbed > 0 {
                    wal.truncate()?;
                }
                // Nothing in this WAL belongs to any segment any more
                if newest_segment > checkpoint_id {
                    checkpoint::write(&config.data_dir, newest_segment)?;
                    checkpoint_id = newest_segment;
                }
            } else {
                let recovered = (recovery.samples.len() - absorbed) as u64;
                for sample in recovery.samples.into_iter().skip(absorbed) {
                    memtable.insert(sample)?;
                }
                stats.record_recovered(recovered);

                // A partially absorbed WAL keeps the checkpoint behind so the
                // same prefix is skipped again until the next flush truncates it
                if absorbed == 0 && newest_segment > checkpoint_id {
                    checkpoint::write(&config.data_dir, newest_segment)?;
                    checkpoint_id = newest_segment;
                }
            }

            Some(wal)
        } else {
            None
        };

        info!(
            data_dir = %config.data_dir.display(),
            segments = segments.len(),
            recovered = memtable.len(),
            wal_enabled = config.wal_enabled,
            "Storage engine opened"
        );

        Ok(StorageEngine {
            config,
            state: RwLock::new(EngineState {
                memtable,
                wal,
                segments,
                next_segment_id,
                checkpoint: checkpoint_id,
                closed: false,
            }),
            stats,
        })
    }

    /// Write one sample. May run a full flush inline.
    pub fn write(&self, sample: Sample) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StorageError::Closed);
        }

        // 1. Write to WAL (durability); a failure leaves the MemTable untouched
        if let Some(wal) = &state.wal {
            wal.append(&sample)?;
        }

        // 2. Write to MemTable
        state.memtable.insert(sample)?;
        self.stats.record_write();

        // 3. If MemTable full, flush to a segment
        if state.memtable.is_full() {
            self.flush_locked(&mut state)?;
        }

        Ok(())
    }

    /// Samples for `metric` with `start <= timestamp <= end`.
    ///
    /// Segments are read oldest first, then the MemTable, so results follow
    /// arrival order. `start > end` yields nothing.
    pub fn query(&self, metric: &str, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        let state = self.state.read();
        if state.closed {
            return Err(StorageError::Closed);
        }

        let mut results = Vec::new();
        for segment in &state.segments {
            results.extend(segment.query(metric, start, end)?);
        }
        results.extend(state.memtable.query(metric, start, end));

        self.stats.record_query();
        Ok(results)
    }

    /// Make every accepted write durable in the WAL without flushing the MemTable
    pub fn sync(&self) -> Result<()> {
        let state = self.state.write();
        if state.closed {
            return Err(StorageError::Closed);
        }

        if let Some(wal) = &state.wal {
            wal.flush()?;
        }
        Ok(())
    }

    /// Persist the MemTable to a segment now, regardless of its size
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StorageError::Closed);
        }
        self.flush_locked(&mut state)
    }

    /// Final flush, then release the WAL. Closing again is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }

        self.flush_locked(&mut state)?;

        if let Some(wal) = &state.wal {
            wal.close()?;
        }
        state.closed = true;

        info!(segments = state.segments.len(), "Storage engine closed");
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Samples currently buffered in memory
    pub fn memtable_len(&self) -> usize {
        self.state.read().memtable.len()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Flush cycle, caller holds the write lock:
    /// WAL sync -> segment write -> MemTable clear -> WAL truncate -> checkpoint.
    /// Any failure stops the cycle with the remaining steps undone.
    fn flush_locked(&self, state: &mut EngineState) -> Result<()> {
        if let Some(wal) = &state.wal {
            wal.flush()?;
        }

        if !state.memtable.is_empty() {
            let position = state
                .wal
                .as_ref()
                .map(Wal::position)
                .unwrap_or_default();

            let reader = self
                .write_segment(state.next_segment_id, &state.memtable, position)
                .map_err(|e| StorageError::FlushFailed(Box::new(e)))?;

            state.segments.push(reader);
            state.next_segment_id += 1;

            // Committed: the segment now serves everything the MemTable held
            state.memtable.clear();
        }
        self.stats.record_flush();

        if let Some(wal) = &state.wal {
            wal.truncate()?;

            let newest = state.next_segment_id - 1;
            if newest > state.checkpoint {
                checkpoint::write(&self.config.data_dir, newest)?;
                state.checkpoint = newest;
            }
        }

        Ok(())
    }

    fn write_segment(
        &self,
        id: u64,
        memtable: &MemTable,
        wal: WalPosition,
    ) -> Result<SegmentReader> {
        let path = self.config.data_dir.join(segment::segment_file_name(id));

        let mut writer = SegmentWriter::new(path.clone(), self.config.compression_enabled)?;
        for (metric, samples) in memtable.iter() {
            writer.add_metric(metric, samples)?;
        }
        let header = writer.finish(wal)?;

        debug!(
            segment = id,
            samples = header.sample_count,
            metrics = header.num_blocks,
            "Flushed MemTable to segment"
        );

        SegmentReader::open(path)
    }
}
