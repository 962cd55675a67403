//! Per-bucket sorted-set index: skiplist-backed score-ordered members.

use std::collections::HashMap;

use crossbeam_skiplist::SkipMap;

use crate::index::Record;

/// An f64 score with a total order, usable as a skiplist key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score(pub f64);

impl Eq for Score {}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Skiplist key: members order by score, ties by member bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScoredMember {
    score: Score,
    member: Vec<u8>,
}

/// One named sorted set: a skiplist over (score, member) plus a member
/// dictionary for score lookups on removal.
#[derive(Default)]
pub struct SortedSet {
    list: SkipMap<ScoredMember, Record>,
    dict: HashMap<Vec<u8>, f64>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: Vec<u8>, record: Record) {
        if let Some(&old) = self.dict.get(&member) {
            self.list.remove(&ScoredMember {
                score: Score(old),
                member: member.clone(),
            });
        }
        self.dict.insert(member.clone(), score);
        self.list.insert(
            ScoredMember {
                score: Score(score),
                member,
            },
            record,
        );
    }

    fn remove(&mut self, member: &[u8]) -> bool {
        match self.dict.remove(member) {
            Some(score) => self
                .list
                .remove(&ScoredMember {
                    score: Score(score),
                    member: member.to_vec(),
                })
                .is_some(),
            None => false,
        }
    }

    fn pop_front(&mut self) -> Option<(f64, Vec<u8>)> {
        let entry = self.list.front()?;
        let key = entry.key().clone();
        drop(entry);
        self.list.remove(&key);
        self.dict.remove(&key.member);
        Some((key.score.0, key.member))
    }

    fn pop_back(&mut self) -> Option<(f64, Vec<u8>)> {
        let entry = self.list.back()?;
        let key = entry.key().clone();
        drop(entry);
        self.list.remove(&key);
        self.dict.remove(&key.member);
        Some((key.score.0, key.member))
    }
}

/// Sorted sets of one bucket, keyed by set name.
#[derive(Default)]
pub struct SortedSetIndex {
    items: HashMap<String, SortedSet>,
}

fn name_of(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

impl SortedSetIndex {
    pub fn zadd(&mut self, key: &[u8], score: f64, member: Vec<u8>, record: Record) {
        self.items
            .entry(name_of(key))
            .or_default()
            .insert(score, member, record);
    }

    pub fn zrem(&mut self, key: &[u8], member: &[u8]) -> bool {
        self.items
            .get_mut(&name_of(key))
            .is_some_and(|set| set.remove(member))
    }

    /// Removes members by ascending rank, 1-based and inclusive; negative
    /// ranks count from the highest score.
    pub fn zrem_range_by_rank(&mut self, key: &[u8], start: i64, end: i64) {
        let Some(set) = self.items.get_mut(&name_of(key)) else {
            return;
        };
        let len = set.list.len() as i64;
        let start = normalize_rank(start, len);
        let end = normalize_rank(end, len);
        if start > end {
            return;
        }

        let targets: Vec<Vec<u8>> = set
            .list
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let rank = *i as i64 + 1;
                rank >= start && rank <= end
            })
            .map(|(_, entry)| entry.key().member.clone())
            .collect();

        for member in targets {
            set.remove(&member);
        }
    }

    pub fn zpop_max(&mut self, key: &[u8]) -> Option<(f64, Vec<u8>)> {
        self.items.get_mut(&name_of(key))?.pop_back()
    }

    pub fn zpop_min(&mut self, key: &[u8]) -> Option<(f64, Vec<u8>)> {
        self.items.get_mut(&name_of(key))?.pop_front()
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.items.get(&name_of(key))?.dict.get(member).copied()
    }

    /// The highest-scored member, without removing it.
    pub fn peek_max(&self, key: &[u8]) -> Option<(f64, Vec<u8>)> {
        let set = self.items.get(&name_of(key))?;
        let entry = set.list.back()?;
        Some((entry.key().score.0, entry.key().member.clone()))
    }

    /// The lowest-scored member, without removing it.
    pub fn peek_min(&self, key: &[u8]) -> Option<(f64, Vec<u8>)> {
        let set = self.items.get(&name_of(key))?;
        let entry = set.list.front()?;
        Some((entry.key().score.0, entry.key().member.clone()))
    }

    /// Members in ascending score order.
    pub fn zrange(&self, key: &[u8]) -> Vec<(f64, Vec<u8>)> {
        self.items
            .get(&name_of(key))
            .map(|set| {
                set.list
                    .iter()
                    .map(|e| (e.key().score.0, e.key().member.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn zcard(&self, key: &[u8]) -> usize {
        self.items.get(&name_of(key)).map_or(0, |set| set.list.len())
    }
}

fn normalize_rank(rank: i64, len: i64) -> i64 {
    if rank < 0 {
        (len + rank + 1).max(1)
    } else {
        rank.max(1)
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
                key: b"z".to_vec(),
                meta: MetaData {
                    timestamp: 0,
                    ttl: PERSISTENT,
                    flag: Flag::ZAdd,
                    ds: DataStructure::SortedSet,
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

    fn members(zset: &SortedSetIndex, key: &[u8]) -> Vec<Vec<u8>> {
        zset.zrange(key).into_iter().map(|(_, m)| m).collect()
    }

    #[test]
    fn test_zadd_orders_by_score() {
        let mut zset = SortedSetIndex::default();
        zset.zadd(b"z", 3.0, b"c".to_vec(), record());
        zset.zadd(b"z", 1.0, b"a".to_vec(), record());
        zset.zadd(b"z", 2.0, b"b".to_vec(), record());

        assert_eq!(members(&zset, b"z"), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(zset.zscore(b"z", b"b"), Some(2.0));
    }

    #[test]
    fn test_zadd_updates_score() {
        let mut zset = SortedSetIndex::default();
        zset.zadd(b"z", 1.0, b"m".to_vec(), record());
        zset.zadd(b"z", 9.0, b"m".to_vec(), record());

        assert_eq!(zset.zcard(b"z"), 1);
        assert_eq!(zset.zscore(b"z", b"m"), Some(9.0));
    }

    #[test]
    fn test_zrem() {
        let mut zset = SortedSetIndex::default();
        zset.zadd(b"z", 1.0, b"a".to_vec(), record());
        zset.zadd(b"z", 2.0, b"b".to_vec(), record());

        assert!(zset.zrem(b"z", b"a"));
        assert!(!zset.zrem(b"z", b"a"));
        assert_eq!(members(&zset, b"z"), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_zpop() {
        let mut zset = SortedSetIndex::default();
        zset.zadd(b"z", 1.0, b"low".to_vec(), record());
        zset.zadd(b"z", 5.0, b"high".to_vec(), record());
        zset.zadd(b"z", 3.0, b"mid".to_vec(), record());

        assert_eq!(zset.zpop_max(b"z"), Some((5.0, b"high".to_vec())));
        assert_eq!(zset.zpop_min(b"z"), Some((1.0, b"low".to_vec())));
        assert_eq!(zset.zcard(b"z"), 1);
    }

    #[test]
    fn test_zrem_range_by_rank() {
        let mut zset = SortedSetIndex::default();
        for (score, member) in [(1.0, b"a"), (2.0, b"b"), (3.0, b"c"), (4.0, b"d")] {
            zset.zadd(b"z", score, member.to_vec(), record());
        }

        // Remove ranks 2..=3 (b and c).
        zset.zrem_range_by_rank(b"z", 2, 3);
        assert_eq!(members(&zset, b"z"), vec![b"a".to_vec(), b"d".to_vec()]);

        // Negative end: everything up to the highest rank.
        zset.zrem_range_by_rank(b"z", 1, -1);
        assert_eq!(zset.zcard(b"z"), 0);
    }
}
