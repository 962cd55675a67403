//! Per-bucket key-range metadata for sparse index mode.
//!
//! Each bucket's smallest and largest keys ever inserted are persisted to
//! a small `bucketMeta-<bucket>` file, rewritten in place whenever a
//! commit widens the range.

use std::fs::OpenOptions;
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errdata;
use crate::error::Result;

/// Smallest and largest keys ever inserted into a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketMeta {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl BucketMeta {
    /// Folds a key into a commit-local scratch range.
    pub fn observe(scratch: Option<BucketMeta>, key: &[u8]) -> BucketMeta {
        match scratch {
            None => BucketMeta {
                start: key.to_vec(),
                end: key.to_vec(),
            },
            Some(mut meta) => {
                if meta.start.as_slice() > key {
                    meta.start = key.to_vec();
                }
                if meta.end.as_slice() < key {
                    meta.end = key.to_vec();
                }
                meta
            }
        }
    }

    /// Widens this range to cover `other`. Returns whether anything changed.
    pub fn widen(&mut self, other: &BucketMeta) -> bool {
        let mut updated = false;
        if self.start > other.start {
            self.start = other.start.clone();
            updated = true;
        }
        if self.end < other.end {
            self.end = other.end.clone();
            updated = true;
        }
        updated
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(8 + self.start.len() + self.end.len());
        buf.write_u32::<BigEndian>(self.start.len() as u32)?;
        buf.write_u32::<BigEndian>(self.end.len() as u32)?;
        buf.extend_from_slice(&self.start);
        buf.extend_from_slice(&self.end);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(errdata!("bucket meta truncated"));
        }
        let mut cursor = Cursor::new(buf);
        let start_size = cursor.read_u32::<BigEndian>()? as usize;
        let end_size = cursor.read_u32::<BigEndian>()? as usize;
        if buf.len() < 8 + start_size + end_size {
            return Err(errdata!("bucket meta truncated"));
        }
        Ok(Self {
            start: buf[8..8 + start_size].to_vec(),
            end: buf[8 + start_size..8 + start_size + end_size].to_vec(),
        })
    }

    /// Rewrites the meta file in place, creating it if absent.
    pub fn persist(&self, path: &Path, sync: bool) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.write_all_at(&self.encode()?, 0)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::decode(&buf)
    }
}

/// Path of the meta file for `bucket`.
pub fn bucket_meta_path(dir: &Path, bucket: &str) -> PathBuf {
    dir.join(format!("bucketMeta-{bucket}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_observe_tracks_min_and_max() {
        let meta = BucketMeta::observe(None, b"m");
        let meta = BucketMeta::observe(Some(meta), b"a");
        let meta = BucketMeta::observe(Some(meta), b"z");
        let meta = BucketMeta::observe(Some(meta), b"q");

        assert_eq!(meta.start, b"a".to_vec());
        assert_eq!(meta.end, b"z".to_vec());
    }

    #[test]
    fn test_widen() {
        let mut meta = BucketMeta {
            start: b"c".to_vec(),
            end: b"x".to_vec(),
        };

        // Narrower range changes nothing.
        assert!(!meta.widen(&BucketMeta {
            start: b"d".to_vec(),
            end: b"w".to_vec(),
        }));

        assert!(meta.widen(&BucketMeta {
            start: b"a".to_vec(),
            end: b"x".to_vec(),
        }));
        assert_eq!(meta.start, b"a".to_vec());
        assert_eq!(meta.end, b"x".to_vec());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let meta = BucketMeta {
            start: b"alpha".to_vec(),
            end: b"omega".to_vec(),
        };
        let decoded = BucketMeta::decode(&meta.encode().expect("Failed to encode"))
            .expect("Failed to decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = bucket_meta_path(dir.path(), "bkt");

        let meta = BucketMeta {
            start: b"a".to_vec(),
            end: b"b".to_vec(),
        };
        meta.persist(&path, true).expect("Failed to persist");
        assert_eq!(BucketMeta::load(&path).expect("Failed to load"), meta);

        // Rewrite in place with a wider range.
        let wider = BucketMeta {
            start: b"0".to_vec(),
            end: b"zz".to_vec(),
        };
        wider.persist(&path, false).expect("Failed to persist");
        assert_eq!(BucketMeta::load(&path).expect("Failed to load"), wider);
    }
}
