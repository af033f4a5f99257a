//! Single-node time-series storage engine
//!
//! Samples (metric, timestamp, value, tags) are appended to a write-ahead
//! log, buffered in a [`MemTable`] and flushed into immutable segment files
//! once the MemTable reaches its size budget. Queries cover one metric over
//! an inclusive millisecond range.
//!
//! ```ignore
//! let engine = StorageEngine::open(StorageConfig::new("./data"))?;
//! engine.write(Sample::new("temp", 1000, 21.5).with_tag("room", "lab"))?;
//! let points = engine.query("temp", 0, 5000)?;
//! engine.close()?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memtable;
pub mod sample;
pub mod segment;
pub mod stats;
pub mod storage_engine;
pub mod wal;

// Re-export commonly used types
pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use memtable::MemTable;
pub use sample::Sample;
pub use stats::{EngineStats, StatsSnapshot};
pub use storage_engine::StorageEngine;
pub use wal::{RecoveryPolicy, Wal, WalPosition, WalRecovery};

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
