use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by the engine and whatever serves requests in front of it.
///
/// Created with the engine and never reset. Reads are lock-free.
#[derive(Debug)]
pub struct EngineStats {
    started_at: Instant,
    points_written: AtomicU64,
    queries_served: AtomicU64,
    flushes: AtomicU64,
    recovered_points: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub points_written: u64,
    pub queries_served: u64,
    pub flushes: u64,
    pub recovered_points: u64,
    pub uptime: Duration,
}

impl EngineStats {
    pub fn new() -> Self {
        EngineStats {
            started_at: Instant::now(),
            points_written: AtomicU64::new(0),
            queries_served: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            recovered_points: AtomicU64::new(0),
        }
    }

    pub fn record_write(&self) {
        self.points_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self, points: u64) {
        self.recovered_points.fetch_add(points, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            points_written: self.points_written.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            recovered_points: self.recovered_points.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}
