//! In-memory indexes, one family per data-structure kind, keyed by bucket.
//!
//! Index updates happen on the commit path (after an entry's bytes have
//! entered the commit stream) and during the startup recovery scan; both
//! paths funnel through [`Indexes::apply_record`] so committed state and
//! recovered state cannot drift apart.

pub mod list;
pub mod set;
pub mod sorted_set;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::EntryIdxMode;
use crate::data_file;
use crate::entry::{is_expired, DataStructure, Flag, MetaData};
use crate::error::Result;

use list::ListIndex;
use set::SetIndex;
use sorted_set::SortedSetIndex;

/// Separator between a list name and an encoded argument in an op key.
pub const LIST_KEY_SEP: u8 = b'|';
/// Separator between a sorted-set name and its encoded score.
pub const ZSET_KEY_SEP: u8 = b'!';
/// Separator between bucket and key in sparse-mode namespaced keys.
pub const BUCKET_KEY_SEP: u8 = b'#';

/// A fixed-size pointer to an entry's location on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Hint {
    pub file_id: u64,
    pub key: Vec<u8>,
    pub meta: MetaData,
    pub data_pos: u64,
}

/// An index record: the hint plus the value when the index mode retains
/// values in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub bucket: String,
    pub value: Option<Vec<u8>>,
    pub hint: Hint,
}

impl Record {
    /// Resolves the record's value, reading it back from its segment file
    /// when the index mode dropped it from memory.
    pub fn value(&self, dir: &Path) -> Result<Vec<u8>> {
        match &self.value {
            Some(value) => Ok(value.clone()),
            None => {
                let entry = data_file::read_entry_at(dir, self.hint.file_id, self.hint.data_pos)?;
                Ok(entry.value)
            }
        }
    }
}

/// The full index set of a database instance.
#[derive(Default)]
pub struct Indexes {
    /// Ordered map: bucket -> key -> record.
    pub btree: HashMap<String, BTreeMap<Vec<u8>, Record>>,
    pub lists: HashMap<String, ListIndex>,
    pub sets: HashMap<String, SetIndex>,
    pub sorted_sets: HashMap<String, SortedSetIndex>,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the whole index of one data-structure kind for a bucket.
    pub fn delete_bucket(&mut self, ds: DataStructure, bucket: &str) {
        match ds {
            DataStructure::Tree => {
                self.btree.remove(bucket);
            }
            DataStructure::List => {
                self.lists.remove(bucket);
            }
            DataStructure::Set => {
                self.sets.remove(bucket);
            }
            DataStructure::SortedSet => {
                self.sorted_sets.remove(bucket);
            }
            DataStructure::None => {}
        }
    }

    /// Applies one committed entry's record to the list, set or sorted-set
    /// index it targets. Tree-ds records are handled by the caller, which
    /// owns TTL scheduling and the sparse-mode branch.
    ///
    /// The op's own arguments ride in the entry value and are captured
    /// before the mode reset drops values from the stored record.
    pub fn apply_record(&mut self, mut record: Record, mode: EntryIdxMode, dir: &Path) {
        let payload = record.value.clone().unwrap_or_default();
        reset_record_by_mode(&mut record, mode);

        match record.hint.meta.ds {
            DataStructure::List => self.apply_list(record, payload, dir),
            DataStructure::Set => self.apply_set(record, payload),
            DataStructure::SortedSet => self.apply_sorted_set(record, payload),
            DataStructure::Tree | DataStructure::None => {}
        }
    }

    fn apply_list(&mut self, record: Record, payload: Vec<u8>, dir: &Path) {
        let meta = record.hint.meta;
        if is_expired(meta.ttl, meta.timestamp) {
            return;
        }

        let list = self.lists.entry(record.bucket.clone()).or_default();
        let key = record.hint.key.clone();

        let result = match meta.flag {
            Flag::ExpireList => {
                let ttl = parse_u64(&payload) as u32;
                list.set_ttl(&key, ttl, meta.timestamp);
                Ok(())
            }
            Flag::LPush => {
                list.lpush(&key, record);
                Ok(())
            }
            Flag::RPush => {
                list.rpush(&key, record);
                Ok(())
            }
            Flag::LPop => {
                list.lpop(&key);
                Ok(())
            }
            Flag::RPop => {
                list.rpop(&key);
                Ok(())
            }
            Flag::LSet => {
                let (name, index) = split_once(&key, LIST_KEY_SEP);
                let index = parse_i64(index);
                let name = name.to_vec();
                list.lset(&name, index, record)
            }
            Flag::LTrim => {
                let (name, start) = split_once(&key, LIST_KEY_SEP);
                let start = parse_i64(start);
                let end = parse_i64(&payload);
                let name = name.to_vec();
                list.ltrim(&name, start, end)
            }
            Flag::LRem => {
                let (count, target) = split_once(&payload, LIST_KEY_SEP);
                let count = parse_i64(count);
                let target = target.to_vec();
                // Matching may read values back from segment files when the
                // index mode does not retain them in memory.
                list.lrem(&key, count, |r| Ok(r.value(dir)? == target))
                    .map(|_| ())
            }
            Flag::LRemByIndex => match bincode::deserialize::<Vec<i64>>(&payload) {
                Ok(indexes) => {
                    list.lrem_by_index(&key, &indexes);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::debug!(error = %e, "List index update skipped");
        }
    }

    fn apply_set(&mut self, record: Record, payload: Vec<u8>) {
        let set = self.sets.entry(record.bucket.clone()).or_default();
        let key = record.hint.key.clone();
        match record.hint.meta.flag {
            Flag::Set => set.sadd(&key, payload, record),
            Flag::Delete => set.srem(&key, &payload),
            _ => {}
        }
    }

    fn apply_sorted_set(&mut self, record: Record, payload: Vec<u8>) {
        let zset = self.sorted_sets.entry(record.bucket.clone()).or_default();
        let op_key = record.hint.key.clone();
        match record.hint.meta.flag {
            Flag::ZAdd => {
                let (name, score) = split_once(&op_key, ZSET_KEY_SEP);
                let score = parse_f64(score);
                let name = name.to_vec();
                zset.zadd(&name, score, payload, record);
            }
            Flag::ZRem => {
                zset.zrem(&op_key, &payload);
            }
            Flag::ZRemRangeByRank => {
                let (start, end) = split_once(&payload, ZSET_KEY_SEP);
                let start = parse_i64(start);
                let end = parse_i64(end);
                zset.zrem_range_by_rank(&op_key, start, end);
            }
            Flag::ZPopMax => {
                zset.zpop_max(&op_key);
            }
            Flag::ZPopMin => {
                zset.zpop_min(&op_key);
            }
            _ => {}
        }
    }
}

/// Drops the in-memory value when the index mode keeps only hints.
pub fn reset_record_by_mode(record: &mut Record, mode: EntryIdxMode) {
    if mode != EntryIdxMode::HintKeyValAndRam {
        record.value = None;
    }
}

/// Joins bucket and key into the sparse-mode namespaced key.
pub fn namespaced_key(bucket: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bucket.len() + 1 + key.len());
    out.extend_from_slice(bucket);
    out.push(BUCKET_KEY_SEP);
    out.extend_from_slice(key);
    out
}

/// Splits `buf` at the first occurrence of `sep`. Without a separator the
/// whole buffer is the first half.
pub(crate) fn split_once(buf: &[u8], sep: u8) -> (&[u8], &[u8]) {
    match buf.iter().position(|&b| b == sep) {
        Some(pos) => (&buf[..pos], &buf[pos + 1..]),
        None => (buf, &[][..]),
    }
}

pub(crate) fn parse_i64(buf: &[u8]) -> i64 {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub(crate) fn parse_u64(buf: &[u8]) -> u64 {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub(crate) fn parse_f64(buf: &[u8]) -> f64 {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Status, PERSISTENT};

    fn record(
        bucket: &str,
        key: &[u8],
        value: &[u8],
        flag: Flag,
        ds: DataStructure,
    ) -> Record {
        Record {
            bucket: bucket.to_string(),
            value: Some(value.to_vec()),
            hint: Hint {
                file_id: 0,
                key: key.to_vec(),
                meta: MetaData {
                    timestamp: crate::entry::now_millis(),
                    ttl: PERSISTENT,
                    flag,
                    ds,
                    status: Status::Committed,
                    tx_id: 1,
                    bucket_size: bucket.len() as u32,
                    key_size: key.len() as u32,
                    value_size: value.len() as u32,
                },
                data_pos: 0,
            },
        }
    }

    #[test]
    fn test_split_once() {
        assert_eq!(split_once(b"name|3", b'|'), (&b"name"[..], &b"3"[..]));
        assert_eq!(split_once(b"plain", b'|'), (&b"plain"[..], &b""[..]));
        assert_eq!(split_once(b"a|b|c", b'|'), (&b"a"[..], &b"b|c"[..]));
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(namespaced_key(b"bkt", b"key"), b"bkt#key".to_vec());
    }

    #[test]
    fn test_delete_bucket_only_touches_one_kind() {
        let mut idx = Indexes::new();
        idx.btree.insert("a".to_string(), BTreeMap::new());
        idx.lists.insert("a".to_string(), ListIndex::default());

        idx.delete_bucket(DataStructure::Tree, "a");
        assert!(!idx.btree.contains_key("a"));
        assert!(idx.lists.contains_key("a"));
    }

    #[test]
    fn test_apply_record_list_ops() {
        let dir = std::env::temp_dir();
        let mut idx = Indexes::new();

        for value in [b"a", b"b", b"c"] {
            idx.apply_record(
                record("bkt", b"l", value, Flag::RPush, DataStructure::List),
                EntryIdxMode::HintKeyValAndRam,
                &dir,
            );
        }
        idx.apply_record(
            record("bkt", b"l", b"", Flag::LPop, DataStructure::List),
            EntryIdxMode::HintKeyValAndRam,
            &dir,
        );

        let list = idx.lists.get("bkt").expect("list bucket missing");
        let values: Vec<_> = list
            .lrange(b"l", 0, -1)
            .into_iter()
            .map(|r| r.value.clone().unwrap())
            .collect();
        assert_eq!(values, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_apply_record_zset_payload_survives_mode_reset() {
        let dir = std::env::temp_dir();
        let mut idx = Indexes::new();

        // In HintKey mode the stored record loses its value, but the op's
        // member payload must still make it into the index.
        idx.apply_record(
            record("bkt", b"z!2.5", b"member", Flag::ZAdd, DataStructure::SortedSet),
            EntryIdxMode::HintKey,
            &dir,
        );

        let zset = idx.sorted_sets.get("bkt").expect("zset bucket missing");
        assert_eq!(zset.zscore(b"z", b"member"), Some(2.5));
    }

    #[test]
    fn test_apply_record_set_membership() {
        let dir = std::env::temp_dir();
        let mut idx = Indexes::new();

        idx.apply_record(
            record("bkt", b"s", b"one", Flag::Set, DataStructure::Set),
            EntryIdxMode::HintKeyValAndRam,
            &dir,
        );
        idx.apply_record(
            record("bkt", b"s", b"two", Flag::Set, DataStructure::Set),
            EntryIdxMode::HintKeyValAndRam,
            &dir,
        );
        idx.apply_record(
            record("bkt", b"s", b"one", Flag::Delete, DataStructure::Set),
            EntryIdxMode::HintKeyValAndRam,
            &dir,
        );

        let set = idx.sets.get("bkt").expect("set bucket missing");
        assert!(set.sismember(b"s", b"two"));
        assert!(!set.sismember(b"s", b"one"));
    }
}
