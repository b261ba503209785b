//! Binary checkpoint formats
//!
//! All integers are big-endian.
//!
//! Finalized file:
//! `i32 file_count`, then `file_count` times `u16 len` + UTF-8 prefix, then
//! `i32 aggregator_len` + aggregator bytes.
//!
//! Metadata file: `i64 entries`, then per entry
//! `i64 file_position, i64 vertex_count, i64 edge_count, u64 max_vertex_id`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BspError, Result};
use crate::graph::VertexId;

const METADATA_ENTRY_LEN: usize = 32;

fn invalid(key: &str, reason: impl Into<String>) -> BspError {
    BspError::CheckpointInvalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn ensure(buf: &[u8], needed: usize, key: &str, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(invalid(
            key,
            format!("truncated {}: need {} bytes, have {}", what, needed, buf.remaining()),
        ));
    }
    Ok(())
}

/// Record written once a superstep's checkpoint is complete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizedCheckpoint {
    /// One file prefix per worker that wrote checkpoint data
    pub file_prefixes: Vec<String>,
    /// Merged aggregators of the preceding superstep
    pub aggregator_data: Vec<u8>,
}

impl FinalizedCheckpoint {
    pub fn encode(&self) -> Result<Bytes> {
        let prefix_bytes: usize = self.file_prefixes.iter().map(|p| 2 + p.len()).sum();
        let mut buf = BytesMut::with_capacity(8 + prefix_bytes + self.aggregator_data.len());

        let count = i32::try_from(self.file_prefixes.len())
            .map_err(|_| invalid("finalized", "too many file prefixes"))?;
        buf.put_i32(count);
        for prefix in &self.file_prefixes {
            let len = u16::try_from(prefix.len())
                .map_err(|_| invalid(prefix, "file prefix longer than 65535 bytes"))?;
            buf.put_u16(len);
            buf.put_slice(prefix.as_bytes());
        }
        let agg_len = i32::try_from(self.aggregator_data.len())
            .map_err(|_| invalid("finalized", "aggregator data too large"))?;
        buf.put_i32(agg_len);
        buf.put_slice(&self.aggregator_data);
        Ok(buf.freeze())
    }

    pub fn decode(key: &str, mut buf: &[u8]) -> Result<Self> {
        ensure(buf, 4, key, "file count")?;
        let count = buf.get_i32();
        if count < 0 {
            return Err(invalid(key, format!("negative file count {}", count)));
        }

        let mut file_prefixes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ensure(buf, 2, key, "prefix length")?;
            let len = buf.get_u16() as usize;
            ensure(buf, len, key, "prefix")?;
            let prefix = std::str::from_utf8(&buf[..len])
                .map_err(|e| invalid(key, format!("prefix is not UTF-8: {}", e)))?
                .to_string();
            buf.advance(len);
            file_prefixes.push(prefix);
        }

        ensure(buf, 4, key, "aggregator length")?;
        let agg_len = buf.get_i32();
        if agg_len < 0 {
            return Err(invalid(key, format!("negative aggregator length {}", agg_len)));
        }
        let agg_len = agg_len as usize;
        ensure(buf, agg_len, key, "aggregator data")?;
        let aggregator_data = buf[..agg_len].to_vec();
        buf.advance(agg_len);

        if buf.has_remaining() {
            return Err(invalid(key, format!("{} trailing bytes", buf.remaining())));
        }
        Ok(Self {
            file_prefixes,
            aggregator_data,
        })
    }
}

/// One vertex range recorded in a worker's checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataEntry {
    pub file_position: i64,
    pub vertex_count: i64,
    pub edge_count: i64,
    pub max_vertex_id: VertexId,
}

/// Index of the ranges stored in one checkpoint data file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub entries: Vec<MetadataEntry>,
}

impl CheckpointMetadata {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.entries.len() * METADATA_ENTRY_LEN);
        buf.put_i64(self.entries.len() as i64);
        for entry in &self.entries {
            buf.put_i64(entry.file_position);
            buf.put_i64(entry.vertex_count);
            buf.put_i64(entry.edge_count);
            buf.put_u64(entry.max_vertex_id);
        }
        buf.freeze()
    }

    pub fn decode(key: &str, mut buf: &[u8]) -> Result<Self> {
        ensure(buf, 8, key, "entry count")?;
        let count = buf.get_i64();
        if count < 0 {
            return Err(invalid(key, format!("negative entry count {}", count)));
        }
        let needed = (count as usize)
            .checked_mul(METADATA_ENTRY_LEN)
            .ok_or_else(|| invalid(key, "entry count overflows"))?;
        ensure(buf, needed, key, "entries")?;

        let entries = (0..count)
            .map(|_| MetadataEntry {
                file_position: buf.get_i64(),
                vertex_count: buf.get_i64(),
                edge_count: buf.get_i64(),
                max_vertex_id: buf.get_u64(),
            })
            .collect();
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalized_layout() {
        let record = FinalizedCheckpoint {
            file_prefixes: vec!["ck/4.a_0".into()],
            aggregator_data: vec![7, 8],
        };
        let bytes = record.encode().unwrap();
        let mut expected = vec![0, 0, 0, 1, 0, 8];
        expected.extend_from_slice(b"ck/4.a_0");
        expected.extend_from_slice(&[0, 0, 0, 2, 7, 8]);
        assert_eq!(bytes.as_ref(), expected.as_slice());
        assert_eq!(FinalizedCheckpoint::decode("k", &bytes).unwrap(), record);
    }

    #[test]
    fn test_finalized_rejects_truncation() {
        let bytes = FinalizedCheckpoint {
            file_prefixes: vec!["a".into(), "b".into()],
            aggregator_data: vec![1, 2, 3],
        }
        .encode()
        .unwrap();
        let err = FinalizedCheckpoint::decode("k", &bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, BspError::CheckpointInvalid { .. }));

        let mut padded = bytes.to_vec();
        padded.push(0);
        assert!(FinalizedCheckpoint::decode("k", &padded).is_err());
    }

    #[test]
    fn test_metadata_layout() {
        let metadata = CheckpointMetadata {
            entries: vec![MetadataEntry {
                file_position: 0,
                vertex_count: 5,
                edge_count: 9,
                max_vertex_id: 99,
            }],
        };
        let bytes = metadata.encode();
        assert_eq!(bytes.len(), 8 + METADATA_ENTRY_LEN);
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[32..], &[0, 0, 0, 0, 0, 0, 0, 99]);
        assert_eq!(CheckpointMetadata::decode("m", &bytes).unwrap(), metadata);
        assert!(CheckpointMetadata::decode("m", &bytes[..20]).is_err());
    }
}
