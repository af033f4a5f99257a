//! Immutable on-disk segments
//!
//! Every flush persists the MemTable into one `segment-NNNNNNNN.seg` file
//! in the data directory. Segments are never rewritten or merged.

pub mod block;
pub mod format;
pub mod reader;
pub mod writer;

pub use format::Header;
pub use reader::SegmentReader;
pub use writer::SegmentWriter;

use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_EXTENSION: &str = ".seg";
const TEMP_SUFFIX: &str = ".tmp";

pub fn segment_file_name(id: u64) -> String {
    format!("{}{:08}{}", SEGMENT_PREFIX, id, SEGMENT_EXTENSION)
}

/// Parse the id out of a segment file name
pub fn parse_segment_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_EXTENSION)?
        .parse()
        .ok()
}

/// All committed segments in `dir`, ordered by id
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            segments.push((id, entry.path()));
        }
    }

    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Delete segment files a crash left half-written. Returns how many were removed.
pub fn remove_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let is_temp = name
            .strip_suffix(TEMP_SUFFIX)
            .and_then(parse_segment_id)
            .is_some();
        if is_temp {
            warn!(file = name, "Removing incomplete segment");
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    Ok(removed)
}
