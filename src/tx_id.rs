use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

// Epoch offset keeps the 41-bit timestamp field from overflowing for
// roughly 69 years: 2020-01-01T00:00:00Z in unix milliseconds.
const EPOCH_MS: u64 = 1_577_836_800_000;

const NODE_BITS: u64 = 10;
const SEQ_BITS: u64 = 12;
const MAX_SEQ: u16 = (1 << SEQ_BITS) - 1;

/// Mints unique 64-bit transaction IDs: a millisecond timestamp in the
/// high bits, the configured node number, and a per-millisecond sequence
/// in the low bits. IDs are monotonic per generator and collision-free
/// across instances with distinct node numbers.
pub struct TxIdGenerator {
    node: u64,
    state: Mutex<GenState>,
}

struct GenState {
    last_ms: u64,
    seq: u16,
}

impl TxIdGenerator {
    pub fn new(node_num: u16) -> Self {
        Self {
            node: u64::from(node_num) & ((1 << NODE_BITS) - 1),
            state: Mutex::new(GenState { last_ms: 0, seq: 0 }),
        }
    }

    /// Returns the next transaction ID.
    pub fn generate(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now = Self::millis();

        if now == state.last_ms {
            if state.seq == MAX_SEQ {
                // Sequence exhausted for this millisecond; wait it out.
                while now <= state.last_ms {
                    now = Self::millis();
                }
                state.seq = 0;
            } else {
                state.seq += 1;
            }
        } else {
            state.seq = 0;
        }
        state.last_ms = now;

        (now << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | u64::from(state.seq)
    }

    fn millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(EPOCH_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let gen = TxIdGenerator::new(1);
        let mut seen = HashSet::new();
        let mut last = 0u64;
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(seen.insert(id), "duplicate tx id generated");
            assert!(id > last, "tx ids must be monotonic");
            last = id;
        }
    }

    #[test]
    fn test_node_number_separates_id_spaces() {
        let a = TxIdGenerator::new(1).generate();
        let b = TxIdGenerator::new(2).generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_concurrent_generation() {
        use std::sync::Arc;

        let gen = Arc::new(TxIdGenerator::new(3));
        let mut handles = vec![];
        for _ in 0..4 {
            let gen = gen.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| gen.generate()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate tx id across threads");
            }
        }
    }
}
