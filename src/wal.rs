use crate::{Result, Sample, StorageError};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default in-memory buffer before appended frames spill to the OS (64KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// What recovery does with a frame cut short by a crash mid-append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Any torn frame fails recovery.
    #[default]
    Strict,
    /// A torn frame at the end of the file is dropped. Malformed complete
    /// frames still fail.
    DiscardTornTail,
}

/// Logical position of the log: bytes of complete frames since the last
/// truncate, and their CRC32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalPosition {
    pub len: u64,
    pub checksum: u32,
}

/// Result of replaying a log file
#[derive(Debug, Default)]
pub struct WalRecovery {
    pub samples: Vec<Sample>,
    /// Bytes covered by complete frames
    pub valid_len: u64,
    pub checksum: u32,
    /// Bytes of a torn trailing frame that were dropped
    pub discarded_tail: u64,
    /// Position after each recovered frame, parallel to `samples`
    pub boundaries: Vec<WalPosition>,
}

impl WalRecovery {
    pub fn position(&self) -> WalPosition {
        WalPosition {
            len: self.valid_len,
            checksum: self.checksum,
        }
    }

    /// Number of leading frames that end exactly at `position`, if any do
    pub fn frames_through(&self, position: WalPosition) -> Option<usize> {
        if position.len == 0 {
            return None;
        }
        self.boundaries
            .iter()
            .position(|b| *b == position)
            .map(|i| i + 1)
    }
}

/// Write-Ahead Log
///
/// A flat sequence of `[u32 length][encoded sample]` frames, little-endian,
/// with no header or checksum. Appends are buffered; only [`Wal::flush`]
/// makes them durable. All operations take an internal lock, so a frame's
/// prefix and payload never interleave with another caller's.
pub struct Wal {
    path: PathBuf,
    buffer_size: usize,
    inner: Mutex<WalInner>,
}

struct WalInner {
    /// `None` once closed
    file: Option<File>,
    buffer: BytesMut,
    len: u64,
    hasher: Hasher,
}

impl Wal {
    /// Create or open a WAL file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(path: impl AsRef<Path>, buffer_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StorageError::DirectoryCreationFailed {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StorageError::LogOpenFailed {
                path: path.clone(),
                source,
            })?;

        Ok(Wal {
            path,
            buffer_size,
            inner: Mutex::new(WalInner {
                file: Some(file),
                buffer: BytesMut::with_capacity(buffer_size),
                len: 0,
                hasher: Hasher::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a sample to the WAL buffer (no fsync)
    pub fn append(&self, sample: &Sample) -> Result<()> {
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + sample.encoded_len());
        encode_frame(sample, &mut frame)?;

        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(StorageError::LogWriteFailed(closed()));
        }

        inner.hasher.update(&frame);
        inner.len += frame.len() as u64;
        inner.buffer.extend_from_slice(&frame);

        // Spill to the OS if the buffer is full; durability still waits for flush()
        if inner.buffer.len() >= self.buffer_size {
            inner.spill().map_err(StorageError::LogWriteFailed)?;
        }

        Ok(())
    }

    /// Flush buffered writes to disk and fsync
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().sync().map_err(StorageError::LogWriteFailed)
    }

    /// Reset the log to zero length.
    ///
    /// Unflushed frames are discarded along with the file content. The file
    /// is emptied through the open handle, so a failure leaves the log and
    /// its position untouched and still writable.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| StorageError::TruncateFailed(closed()))?;
        file.set_len(0).map_err(StorageError::TruncateFailed)?;
        file.sync_all().map_err(StorageError::TruncateFailed)?;

        inner.buffer.clear();
        inner.len = 0;
        inner.hasher = Hasher::new();

        debug!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Flush, sync and release the file handle. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Ok(());
        }

        inner.sync().map_err(StorageError::CloseFailed)?;
        inner.file = None;
        Ok(())
    }

    /// Current logical position over every frame appended since the last truncate
    pub fn position(&self) -> WalPosition {
        let inner = self.inner.lock();
        WalPosition {
            len: inner.len,
            checksum: inner.hasher.clone().finalize(),
        }
    }

    /// Continue from a recovery of this same file.
    ///
    /// Must run before the first append. Seeds the position from the
    /// recovered frames and trims a discarded torn tail off the file so new
    /// frames start on a clean boundary.
    pub fn resume(&self, recovery: &WalRecovery) -> Result<()> {
        let mut inner = self.inner.lock();

        if recovery.discarded_tail > 0 {
            let file = inner
                .file
                .as_ref()
                .ok_or_else(|| StorageError::TruncateFailed(closed()))?;
            file.set_len(recovery.valid_len)
                .map_err(StorageError::TruncateFailed)?;
            file.sync_all().map_err(StorageError::TruncateFailed)?;

            warn!(
                path = %self.path.display(),
                discarded = recovery.discarded_tail,
                "Trimmed torn WAL tail"
            );
        }

        inner.len = recovery.valid_len;
        inner.hasher = Hasher::new_with_initial(recovery.checksum);
        Ok(())
    }

    /// Get the current on-disk file size
    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Recover samples from a WAL file, failing on any torn frame
    pub fn recover(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
        Ok(Self::recover_with_policy(path, RecoveryPolicy::Strict)?.samples)
    }

    /// Replay a WAL file from the beginning.
    ///
    /// A missing file yields an empty recovery. End of file exactly at a
    /// length prefix is the normal end; anything shorter is a torn frame,
    /// handled per `policy`.
    pub fn recover_with_policy(
        path: impl AsRef<Path>,
        policy: RecoveryPolicy,
    ) -> Result<WalRecovery> {
        let path = path.as_ref();

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(WalRecovery::default());
            }
            Err(source) => {
                return Err(StorageError::LogOpenFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut reader = BufReader::new(file);
        let mut recovery = WalRecovery::default();
        let mut hasher = Hasher::new();

        loop {
            match read_frame(&mut reader)? {
                Frame::Complete { prefix, payload } => {
                    let sample = Sample::decode(&payload).map_err(|e| {
                        StorageError::DecodeFailed(format!(
                            "frame at offset {}: {}",
                            recovery.valid_len, e
                        ))
                    })?;

                    hasher.update(&prefix);
                    hasher.update(&payload);
                    recovery.valid_len += (LENGTH_PREFIX_SIZE + payload.len()) as u64;
                    recovery.samples.push(sample);
                    recovery.boundaries.push(WalPosition {
                        len: recovery.valid_len,
                        checksum: hasher.clone().finalize(),
                    });
                }
                Frame::Eof => break,
                Frame::Torn { read, expected } => match policy {
                    RecoveryPolicy::Strict => {
                        return Err(StorageError::DecodeFailed(format!(
                            "torn frame at offset {}: expected {} bytes, found {}",
                            recovery.valid_len, expected, read
                        )));
                    }
                    RecoveryPolicy::DiscardTornTail => {
                        warn!(
                            path = %path.display(),
                            offset = recovery.valid_len,
                            bytes = read,
                            "Discarding torn WAL tail"
                        );
                        recovery.discarded_tail = read;
                        break;
                    }
                },
            }
        }

        recovery.checksum = hasher.finalize();

        debug!(
            path = %path.display(),
            samples = recovery.samples.len(),
            bytes = recovery.valid_len,
            "WAL recovered"
        );

        Ok(recovery)
    }
}

impl WalInner {
    /// Push buffered bytes to the OS without syncing
    fn spill(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.spill()?;
        self.file.as_ref().ok_or_else(closed)?.sync_all()
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Ensure any buffered data reaches disk on drop
        let inner = self.inner.get_mut();
        if inner.file.is_some() {
            if let Err(e) = inner.sync() {
                warn!(path = %self.path.display(), error = %e, "WAL flush on drop failed");
            }
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "WAL is closed")
}

/// Write `[u32 length][encoded sample]` into `buf`
pub(crate) fn encode_frame(sample: &Sample, buf: &mut BytesMut) -> Result<()> {
    let len = sample.encoded_len();
    if len > u32::MAX as usize {
        return Err(StorageError::EncodeFailed("Record too large".into()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + len);
    buf.put_u32_le(len as u32);
    sample.encode_into(buf)
}

/// Decode a buffer that holds nothing but complete frames
pub(crate) fn decode_frames(mut data: &[u8]) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();

    while data.has_remaining() {
        if data.remaining() < LENGTH_PREFIX_SIZE {
            return Err(StorageError::DecodeFailed("Truncated frame length".into()));
        }
        let len = data.get_u32_le() as usize;
        if data.remaining() < len {
            return Err(StorageError::DecodeFailed(format!(
                "Truncated frame: need {} bytes, have {}",
                len,
                data.remaining()
            )));
        }
        samples.push(Sample::decode(&data[..len])?);
        data.advance(len);
    }

    Ok(samples)
}

enum Frame {
    Complete { prefix: [u8; 4], payload: Vec<u8> },
    Eof,
    Torn { read: u64, expected: u64 },
}

/// Read one frame from the stream
fn read_frame(reader: &mut impl Read) -> Result<Frame> {
    let header = read_up_to(reader, LENGTH_PREFIX_SIZE as u64)?;
    if header.is_empty() {
        return Ok(Frame::Eof);
    }
    if header.len() < LENGTH_PREFIX_SIZE {
        return Ok(Frame::Torn {
            read: header.len() as u64,
            expected: LENGTH_PREFIX_SIZE as u64,
        });
    }

    let prefix = [header[0], header[1], header[2], header[3]];
    let length = u32::from_le_bytes(prefix) as u64;

    // Grows with what is actually on disk, so a corrupt length can't force a huge allocation
    let payload = read_up_to(reader, length)?;
    if (payload.len() as u64) < length {
        return Ok(Frame::Torn {
            read: (LENGTH_PREFIX_SIZE + payload.len()) as u64,
            expected: LENGTH_PREFIX_SIZE as u64 + length,
        });
    }

    Ok(Frame::Complete { prefix, payload })
}

fn read_up_to(reader: &mut impl Read, limit: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(limit).read_to_end(&mut buf)?;
    Ok(buf)
}
