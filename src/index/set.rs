//! Per-bucket set index: named sets of byte-string members.

use std::collections::HashMap;

use crate::index::Record;

/// Sets of one bucket, keyed by set name. Members map to the record that
/// last added them so reads can resolve hints.
#[derive(Default)]
pub struct SetIndex {
    pub items: HashMap<String, HashMap<Vec<u8>, Record>>,
}

fn name_of(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

impl SetIndex {
    pub fn sadd(&mut self, key: &[u8], member: Vec<u8>, record: Record) {
        self.items
            .entry(name_of(key))
            .or_default()
            .insert(member, record);
    }

    pub fn srem(&mut self, key: &[u8], member: &[u8]) {
        if let Some(set) = self.items.get_mut(&name_of(key)) {
            set.remove(member);
        }
    }

    pub fn sismember(&self, key: &[u8], member: &[u8]) -> bool {
        self.items
            .get(&name_of(key))
            .is_some_and(|set| set.contains_key(member))
    }

    pub fn smembers(&self, key: &[u8]) -> Vec<&Vec<u8>> {
        self.items
            .get(&name_of(key))
            .map(|set| set.keys().collect())
            .unwrap_or_default()
    }

    pub fn scard(&self, key: &[u8]) -> usize {
        self.items.get(&name_of(key)).map_or(0, |set| set.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DataStructure, Flag, MetaData, Status, PERSISTENT};
    use crate::index::Hint;

    fn record() -> Record {
        Record {
            bucket: "b".to_string(),
            value: None,
            hint: Hint {
                file_id: 0,
                key: b"s".to_vec(),
                meta: MetaData {
                    timestamp: 0,
                    ttl: PERSISTENT,
                    flag: Flag::Set,
                    ds: DataStructure::Set,
                    status: Status::Committed,
                    tx_id: 0,
                    bucket_size: 1,
                    key_size: 1,
                    value_size: 0,
                },
                data_pos: 0,
            },
        }
    }

    #[test]
    fn test_add_remove_membership() {
        let mut set = SetIndex::default();
        set.sadd(b"s", b"one".to_vec(), record());
        set.sadd(b"s", b"two".to_vec(), record());
        set.sadd(b"s", b"one".to_vec(), record()); // idempotent

        assert_eq!(set.scard(b"s"), 2);
        assert!(set.sismember(b"s", b"one"));
        assert!(!set.sismember(b"s", b"three"));

        set.srem(b"s", b"one");
        assert!(!set.sismember(b"s", b"one"));
        assert_eq!(set.scard(b"s"), 1);
    }

    #[test]
    fn test_missing_set() {
        let set = SetIndex::default();
        assert!(!set.sismember(b"nope", b"x"));
        assert!(set.smembers(b"nope").is_empty());
        assert_eq!(set.scard(b"nope"), 0);
    }
}
