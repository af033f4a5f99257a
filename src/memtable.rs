use crate::{Result, Sample, Timestamp};
use std::collections::BTreeMap;

const BYTES_PER_MB: usize = 1024 * 1024;

/// In-memory buffer of recent samples, indexed by metric
///
/// Each metric keeps its samples in arrival order. Nothing is sorted by
/// timestamp, neither on insert nor on query. When the size estimate reaches
/// the configured threshold the owner should flush the table to a segment.
pub struct MemTable {
    data: BTreeMap<String, Vec<Sample>>,
    size_bytes: usize,
    sample_count: usize,
    max_size: usize,
}

impl MemTable {
    pub fn new(max_memory_mb: usize) -> Self {
        MemTable {
            data: BTreeMap::new(),
            size_bytes: 0,
            sample_count: 0,
            max_size: max_memory_mb.saturating_mul(BYTES_PER_MB),
        }
    }

    /// Append a sample to its metric's sequence
    pub fn insert(&mut self, sample: Sample) -> Result<()> {
        self.size_bytes += sample.size_estimate();
        self.sample_count += 1;

        match self.data.get_mut(&sample.metric) {
            Some(samples) => samples.push(sample),
            None => {
                self.data.insert(sample.metric.clone(), vec![sample]);
            }
        }

        Ok(())
    }

    /// Samples for `metric` with `start <= timestamp <= end`, in insertion order
    pub fn query(&self, metric: &str, start: Timestamp, end: Timestamp) -> Vec<Sample> {
        match self.data.get(metric) {
            Some(samples) => samples
                .iter()
                .filter(|s| s.timestamp >= start && s.timestamp <= end)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.size_bytes >= self.max_size
    }

    /// Drop every sample and reset the size counter
    pub fn clear(&mut self) {
        self.data.clear();
        self.size_bytes = 0;
        self.sample_count = 0;
    }

    /// Get current size estimate in bytes
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Number of buffered samples across all metrics
    pub fn len(&self) -> usize {
        self.sample_count
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn metric_count(&self) -> usize {
        self.data.len()
    }

    /// All metrics in ascending name order with their samples (for flushing to a segment)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Sample])> {
        self.data.iter().map(|(m, s)| (m.as_str(), s.as_slice()))
    }
}
