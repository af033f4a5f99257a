//! Flush checkpoint
//!
//! Records the id of the newest segment whose WAL generation has been
//! truncated. A segment newer than the checkpoint may still have its data in
//! the current WAL; an older one never does. The file is replaced atomically.
//!
//! ```text
//! [u32 magic "TCKP"][u64 segment id][u32 crc32 of the previous 12 bytes]
//! ```

use crate::segment::writer::sync_dir;
use crate::{Result, StorageError};
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CHECKPOINT_FILE: &str = "CHECKPOINT";

const CHECKPOINT_MAGIC: u32 = 0x5443_4B50;
const CHECKPOINT_SIZE: usize = 16;

pub fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE)
}

/// Last segment id whose WAL was truncated, or 0 when nothing was recorded
pub fn read(dir: &Path) -> Result<u64> {
    let data = match fs::read(checkpoint_path(dir)) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    if data.len() != CHECKPOINT_SIZE {
        return Err(StorageError::CorruptedCheckpoint(format!(
            "expected {} bytes, found {}",
            CHECKPOINT_SIZE,
            data.len()
        )));
    }

    let expected = crc32fast::hash(&data[..12]);
    let mut buf = &data[..];
    let magic = buf.get_u32_le();
    let segment_id = buf.get_u64_le();
    let checksum = buf.get_u32_le();

    if magic != CHECKPOINT_MAGIC {
        return Err(StorageError::CorruptedCheckpoint(format!(
            "invalid magic number: {:#x}",
            magic
        )));
    }
    if checksum != expected {
        return Err(StorageError::CorruptedCheckpoint("checksum mismatch".into()));
    }

    Ok(segment_id)
}

/// Durably replace the checkpoint with `segment_id`
pub fn write(dir: &Path, segment_id: u64) -> Result<()> {
    let mut buf = BytesMut::with_capacity(CHECKPOINT_SIZE);
    buf.put_u32_le(CHECKPOINT_MAGIC);
    buf.put_u64_le(segment_id);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);

    let path = checkpoint_path(dir);
    let tmp_path = dir.join(format!("{}.tmp", CHECKPOINT_FILE));

    let mut file = File::create(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &path)?;
    sync_dir(&path)?;

    debug!(segment = segment_id, "Checkpoint advanced");
    Ok(())
}
