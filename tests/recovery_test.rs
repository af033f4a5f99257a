use pulsar_storage::segment::{self, SegmentWriter};
use pulsar_storage::{
    RecoveryPolicy, Result, Sample, StorageConfig, StorageEngine, StorageError, Wal,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn write_series(engine: &StorageEngine, metric: &str, count: i64) -> Result<()> {
    for i in 0..count {
        engine.write(Sample::new(metric, 1000 + i, i as f64).with_tag("host", "server1"))?;
    }
    Ok(())
}

/// Drop the engine without running destructors, like a killed process
fn crash(engine: StorageEngine) {
    std::mem::forget(engine);
}

fn append_garbage(path: &Path, bytes: &[u8]) {
    OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap()
        .write_all(bytes)
        .unwrap();
}

#[test]
fn test_synced_writes_survive_crash() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 100)?;
    engine.sync()?;
    crash(engine);

    let engine = StorageEngine::open(config)?;
    let recovered = engine.query("cpu", 0, i64::MAX)?;

    assert_eq!(recovered.len(), 100);
    assert_eq!(recovered[0].timestamp, 1000);
    assert_eq!(recovered[99].timestamp, 1099);
    assert_eq!(recovered[0].tags.get("host").map(String::as_str), Some("server1"));
    assert_eq!(engine.stats().recovered_points, 100);
    assert_eq!(engine.segment_count(), 0);

    engine.close()
}

#[test]
fn test_unsynced_writes_are_not_durable() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    // Well under the WAL buffer, so nothing reaches the file
    write_series(&engine, "cpu", 3)?;
    crash(engine);

    let engine = StorageEngine::open(config)?;
    assert!(engine.query("cpu", 0, i64::MAX)?.is_empty());
    engine.close()
}

#[test]
fn test_drop_without_close_keeps_wal_content() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    {
        let engine = StorageEngine::open(config.clone())?;
        write_series(&engine, "cpu", 10)?;
    }

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 10);
    engine.close()
}

#[test]
fn test_close_then_reopen_reads_segments() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    {
        let engine = StorageEngine::open(config.clone())?;
        write_series(&engine, "cpu", 50)?;
        engine.flush()?;
        write_series(&engine, "mem", 20)?;
        engine.close()?;
    }
    assert_eq!(fs::metadata(dir.path().join("wal.log"))?.len(), 0);

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.segment_count(), 2);
    assert_eq!(engine.memtable_len(), 0);
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 50);
    assert_eq!(engine.query("mem", 1005, 1009)?.len(), 5);

    // New segments continue the id sequence
    engine.write(Sample::new("cpu", 1, 1.0))?;
    engine.flush()?;
    let ids: Vec<_> = segment::list_segments(dir.path())?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    engine.close()
}

#[test]
fn test_torn_tail_fails_strict_open() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 5)?;
    engine.sync()?;
    crash(engine);

    // Length prefix promising 64 bytes, followed by 3
    append_garbage(&config.wal_path, &[64, 0, 0, 0, 1, 2, 3]);

    match StorageEngine::open(config) {
        Err(StorageError::DecodeFailed(_)) => Ok(()),
        Err(e) => panic!("expected DecodeFailed, got {}", e),
        Ok(_) => panic!("strict recovery accepted a torn frame"),
    }
}

#[test]
fn test_torn_tail_discarded_when_configured() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path()).wal_recovery(RecoveryPolicy::DiscardTornTail);

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 5)?;
    engine.sync()?;
    crash(engine);

    append_garbage(&config.wal_path, &[64, 0, 0, 0, 1, 2, 3]);

    let engine = StorageEngine::open(config.clone())?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 5);

    // The tail was trimmed, so new frames are readable under the strict policy
    engine.write(Sample::new("cpu", 5000, 1.0))?;
    engine.sync()?;
    crash(engine);

    let strict = config.wal_recovery(RecoveryPolicy::Strict);
    let engine = StorageEngine::open(strict)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 6);
    engine.close()
}

#[test]
fn test_segment_committed_before_wal_truncate_is_not_replayed() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 20)?;
    engine.sync()?;
    crash(engine);

    // Reproduce the state of a flush that died right after the segment rename
    let recovery = Wal::recover_with_policy(&config.wal_path, RecoveryPolicy::Strict)?;
    let mut writer =
        SegmentWriter::new(dir.path().join(segment::segment_file_name(1)), true)?;
    writer.add_metric("cpu", &recovery.samples)?;
    writer.finish(recovery.position())?;

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 20);
    assert_eq!(engine.memtable_len(), 0);
    assert_eq!(fs::metadata(dir.path().join("wal.log"))?.len(), 0);

    engine.close()
}

#[test]
fn test_incomplete_segment_is_removed_on_open() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 10)?;
    engine.sync()?;
    crash(engine);

    // A flush that died before the rename
    let tmp = dir.path().join("segment-00000001.seg.tmp");
    fs::write(&tmp, b"partial")?;

    let engine = StorageEngine::open(config)?;
    assert!(!tmp.exists());
    assert_eq!(engine.segment_count(), 0);
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 10);
    engine.close()
}

#[test]
fn test_corrupt_segment_aborts_open() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    {
        let engine = StorageEngine::open(config.clone())?;
        write_series(&engine, "cpu", 10)?;
        engine.close()?;
    }

    let path = dir.path().join(segment::segment_file_name(1));
    let mut bytes = fs::read(&path)?;
    bytes[0] ^= 0xFF;
    fs::write(&path, bytes)?;

    assert!(matches!(
        StorageEngine::open(config),
        Err(StorageError::CorruptedSegment(_))
    ));
    Ok(())
}

#[test]
fn test_wal_in_separate_directory() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path().join("data"))
        .wal_path(dir.path().join("logs").join("pulsar.wal"));

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 3)?;
    engine.sync()?;
    crash(engine);

    assert!(dir.path().join("logs").join("pulsar.wal").exists());

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 3);
    engine.close()
}

#[test]
fn test_identical_write_after_flush_survives_crash() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    engine.write(Sample::new("cpu", 1000, 1.0))?;
    engine.flush()?;
    // Same bytes as the flushed WAL generation
    engine.write(Sample::new("cpu", 1000, 1.0))?;
    engine.sync()?;
    crash(engine);

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 2);
    assert_eq!(engine.memtable_len(), 1);
    assert_eq!(engine.stats().recovered_points, 1);
    engine.close()
}

#[test]
fn test_identical_write_after_restart_survives_crash() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    {
        let engine = StorageEngine::open(config.clone())?;
        engine.write(Sample::new("cpu", 1000, 1.0))?;
        engine.close()?;
    }

    let engine = StorageEngine::open(config.clone())?;
    engine.write(Sample::new("cpu", 1000, 1.0))?;
    engine.sync()?;
    crash(engine);

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 2);
    engine.close()
}

#[test]
fn test_untruncated_wal_prefix_is_skipped_on_restart() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 5)?;
    engine.sync()?;
    crash(engine);

    // Segment committed, WAL truncate failed, then more writes reached the log
    let recovery = Wal::recover_with_policy(&config.wal_path, RecoveryPolicy::Strict)?;
    let mut writer =
        SegmentWriter::new(dir.path().join(segment::segment_file_name(1)), true)?;
    writer.add_metric("cpu", &recovery.samples)?;
    writer.finish(recovery.position())?;
    {
        let wal = Wal::open(&config.wal_path)?;
        wal.resume(&recovery)?;
        wal.append(&Sample::new("cpu", 9000, 9.0))?;
        wal.append(&Sample::new("mem", 9000, 0.5))?;
        wal.flush()?;
    }

    let engine = StorageEngine::open(config.clone())?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 6);
    assert_eq!(engine.query("mem", 0, i64::MAX)?.len(), 1);
    assert_eq!(engine.memtable_len(), 2);
    assert_eq!(engine.stats().recovered_points, 2);
    crash(engine);

    // Still skipped on a second restart, then cleared by the next flush
    let engine = StorageEngine::open(config.clone())?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 6);
    engine.flush()?;
    crash(engine);

    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.segment_count(), 2);
    assert_eq!(engine.memtable_len(), 0);
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 6);
    assert_eq!(engine.query("mem", 0, i64::MAX)?.len(), 1);
    engine.close()
}

#[test]
fn test_failure_after_segment_commit_keeps_engine_consistent() -> Result<()> {
    let dir = tempdir()?;
    let config = StorageConfig::new(dir.path());

    let engine = StorageEngine::open(config.clone())?;
    write_series(&engine, "cpu", 3)?;

    // A directory in the way makes the checkpoint replace fail after the segment lands
    let blocker = dir.path().join("CHECKPOINT");
    fs::create_dir(&blocker)?;
    assert!(engine.flush().is_err());

    assert_eq!(engine.segment_count(), 1);
    assert_eq!(engine.memtable_len(), 0);
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 3);

    engine.write(Sample::new("cpu", 5000, 5.0))?;
    engine.sync()?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 4);
    crash(engine);

    fs::remove_dir(&blocker)?;
    let engine = StorageEngine::open(config)?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 4);
    assert_eq!(engine.memtable_len(), 1);
    engine.close()
}

#[cfg(unix)]
#[test]
fn test_flush_with_wal_directory_removed() -> Result<()> {
    let dir = tempdir()?;
    let logs = dir.path().join("logs");
    let config = StorageConfig::new(dir.path().join("data")).wal_path(logs.join("pulsar.wal"));

    let engine = StorageEngine::open(config)?;
    write_series(&engine, "cpu", 3)?;

    fs::remove_dir_all(&logs)?;
    engine.flush()?;

    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 3);
    assert_eq!(engine.segment_count(), 1);

    // The log is emptied in place, so the handle stays writable
    engine.write(Sample::new("cpu", 5000, 5.0))?;
    engine.sync()?;
    assert_eq!(engine.query("cpu", 0, i64::MAX)?.len(), 4);
    engine.close()
}
