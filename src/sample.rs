use crate::{Result, StorageError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed per-sample bookkeeping overhead used by [`Sample::size_estimate`]
const SIZE_OVERHEAD: usize = 48;

/// One timestamped, tagged measurement for a named metric.
///
/// Tags live in a `BTreeMap`, so iteration is already in the ascending key
/// order the binary encoding requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: Timestamp,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, timestamp: Timestamp, value: f64) -> Self {
        Sample {
            metric: metric.into(),
            timestamp,
            value,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Approximate in-memory footprint. Drives MemTable fullness, not the wire size.
    pub fn size_estimate(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.metric.len() + 8 + 8 + tags + SIZE_OVERHEAD
    }

    /// Exact number of bytes [`Sample::encode`] produces
    pub fn encoded_len(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
        4 + self.metric.len() + 8 + 8 + 4 + tags
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Append the binary form to `buf`.
    ///
    /// Layout (little-endian):
    /// `[u32 metric_len][metric][i64 timestamp][f64 value][u32 tag_count]`
    /// then `[u32 key_len][key][u32 val_len][val]` per tag in ascending key order.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if self.tags.len() > u32::MAX as usize {
            return Err(StorageError::EncodeFailed("Too many tags".into()));
        }

        put_str(buf, &self.metric, "metric")?;
        buf.put_i64_le(self.timestamp);
        buf.put_f64_le(self.value);

        buf.put_u32_le(self.tags.len() as u32);
        for (key, value) in &self.tags {
            put_str(buf, key, "tag key")?;
            put_str(buf, value, "tag value")?;
        }

        Ok(())
    }

    /// Decode exactly one sample from `data`.
    ///
    /// Truncated input or leftover bytes are errors; there is no partial result.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        let metric = get_str(&mut buf, "metric")?;

        if buf.remaining() < 16 {
            return Err(StorageError::DecodeFailed(
                "Truncated timestamp/value".into(),
            ));
        }
        let timestamp = buf.get_i64_le();
        let value = buf.get_f64_le();

        let tag_count = get_u32(&mut buf, "tag count")?;
        let mut tags = BTreeMap::new();
        for _ in 0..tag_count {
            let key = get_str(&mut buf, "tag key")?;
            let value = get_str(&mut buf, "tag value")?;
            tags.insert(key, value);
        }

        if buf.has_remaining() {
            return Err(StorageError::DecodeFailed(format!(
                "{} trailing bytes after sample",
                buf.remaining()
            )));
        }

        Ok(Sample {
            metric,
            timestamp,
            value,
            tags,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str, what: &str) -> Result<()> {
    if s.len() > u32::MAX as usize {
        return Err(StorageError::EncodeFailed(format!("{} too long", what)));
    }
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(StorageError::DecodeFailed(format!("Truncated {}", what)));
    }
    Ok(buf.get_u32_le())
}

fn get_str(buf: &mut &[u8], what: &str) -> Result<String> {
    let len = get_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(StorageError::DecodeFailed(format!(
            "Truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| StorageError::DecodeFailed(format!("Invalid UTF-8 in {}: {}", what, e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}
