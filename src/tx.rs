//! Transactions: pending-write buffering, the commit path, rollback.
//!
//! A transaction moves through Running -> Committing -> Closed, published
//! through an atomic cell so concurrent observers (a commit callback, a
//! rollback attempt from another thread) see a consistent view. A
//! writable transaction owns the database's exclusive lock for its whole
//! life; readers share it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock};

use crate::bptree::disk::{
    bpt_path, bpt_root_path, bpt_root_tx_id_path, bpt_tx_id_path, BPTreeRootIdx,
};
use crate::bptree::BPTree;
use crate::bucket_meta::{bucket_meta_path, BucketMeta};
use crate::config::{EntryIdxMode, Options, RwMode};
use crate::data_file::{self, DataFile};
use crate::db::{DbCore, DbState};
use crate::entry::{
    is_expired, now_millis, DataStructure, Entry, Flag, MetaData, Status, PERSISTENT,
};
use crate::error::{Error, Result};
use crate::index::{namespaced_key, Hint, Record, LIST_KEY_SEP, ZSET_KEY_SEP};

const TX_STATUS_RUNNING: u8 = 1;
const TX_STATUS_COMMITTING: u8 = 2;
const TX_STATUS_CLOSED: u8 = 3;

type ReadGuard = ArcRwLockReadGuard<RawRwLock, DbState>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, DbState>;

/// The database lock held by a transaction: shared for readers,
/// exclusive for the single writer.
enum StateGuard {
    Read(ReadGuard),
    Write(WriteGuard),
}

impl StateGuard {
    fn state(&self) -> &DbState {
        match self {
            StateGuard::Read(guard) => guard,
            StateGuard::Write(guard) => guard,
        }
    }
}

struct TxInner {
    db: Option<Arc<DbCore>>,
    guard: Option<StateGuard>,
    pending_writes: Vec<Entry>,
    reserved_tx_id_idxes: HashMap<u64, BPTree>,
    size: u64,
}

/// A transaction. Writable transactions buffer mutations in memory and
/// apply them atomically at commit; read transactions see only committed
/// state.
pub struct Tx {
    id: u64,
    writable: bool,
    status: AtomicU8,
    inner: Mutex<TxInner>,
}

impl Tx {
    pub(crate) fn begin(core: &Arc<DbCore>, writable: bool) -> Result<Tx> {
        let tx = Tx {
            id: core.tx_ids.generate(),
            writable,
            status: AtomicU8::new(TX_STATUS_RUNNING),
            inner: Mutex::new(TxInner {
                db: Some(Arc::clone(core)),
                guard: None,
                pending_writes: Vec::new(),
                reserved_tx_id_idxes: HashMap::new(),
                size: 0,
            }),
        };

        {
            let mut inner = tx.inner.lock();
            inner.guard = Some(if writable {
                StateGuard::Write(core.state.write_arc())
            } else {
                StateGuard::Read(core.state.read_arc())
            });
        }
        tx.set_status(TX_STATUS_RUNNING);

        if core.closed.load(Ordering::SeqCst) {
            let mut inner = tx.inner.lock();
            inner.guard = None;
            inner.db = None;
            drop(inner);
            tx.set_status(TX_STATUS_CLOSED);
            return Err(Error::DbClosed);
        }

        Ok(tx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    // ------------------------------------------------------------------
    // Status FSM
    // ------------------------------------------------------------------

    fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::SeqCst);
    }

    fn status(&self) -> u8 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.status() == TX_STATUS_RUNNING
    }

    pub fn is_committing(&self) -> bool {
        self.status() == TX_STATUS_COMMITTING
    }

    pub fn is_closed(&self) -> bool {
        self.status() == TX_STATUS_CLOSED
    }

    // ------------------------------------------------------------------
    // Write buffering
    // ------------------------------------------------------------------

    /// Appends a validated entry to the pending batch.
    fn push(
        &self,
        bucket: &str,
        key: &[u8],
        value: &[u8],
        ttl: u32,
        flag: Flag,
        timestamp: u64,
        ds: DataStructure,
    ) -> Result<()> {
        let entry = self.make_entry(bucket, key, value, ttl, flag, timestamp, ds);
        entry.valid()?;
        self.append(entry)
    }

    /// Appends an internally generated entry, skipping user validation.
    fn push_raw(
        &self,
        bucket: &str,
        key: &[u8],
        value: &[u8],
        ttl: u32,
        flag: Flag,
        timestamp: u64,
        ds: DataStructure,
    ) -> Result<()> {
        let entry = self.make_entry(bucket, key, value, ttl, flag, timestamp, ds);
        self.append(entry)
    }

    fn make_entry(
        &self,
        bucket: &str,
        key: &[u8],
        value: &[u8],
        ttl: u32,
        flag: Flag,
        timestamp: u64,
        ds: DataStructure,
    ) -> Entry {
        Entry::new(
            bucket.as_bytes().to_vec(),
            key.to_vec(),
            value.to_vec(),
            MetaData {
                timestamp,
                ttl,
                flag,
                ds,
                status: Status::UnCommitted,
                tx_id: self.id,
                bucket_size: bucket.len() as u32,
                key_size: key.len() as u32,
                value_size: value.len() as u32,
            },
        )
    }

    fn append(&self, entry: Entry) -> Result<()> {
        let mut inner = self.inner.lock();
        let db = inner.db.clone().ok_or(Error::TxClosed)?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if inner.pending_writes.len() as u64 >= db.opts.max_batch_count
            || inner.size >= db.opts.max_batch_size
        {
            return Err(Error::TxnTooBig);
        }

        inner.size += entry.size();
        inner.pending_writes.push(entry);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ordered map operations
    // ------------------------------------------------------------------

    /// Sets the value for a key in the bucket.
    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8], ttl: u32) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            ttl,
            Flag::Set,
            now_millis(),
            DataStructure::Tree,
        )
    }

    /// Sets the value for a key with an explicit write timestamp.
    pub fn put_with_timestamp(
        &self,
        bucket: &str,
        key: &[u8],
        value: &[u8],
        ttl: u32,
        timestamp: u64,
    ) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            ttl,
            Flag::Set,
            timestamp,
            DataStructure::Tree,
        )
    }

    /// Removes a key from the bucket.
    pub fn delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        self.push(
            bucket,
            key,
            &[],
            PERSISTENT,
            Flag::Delete,
            now_millis(),
            DataStructure::Tree,
        )
    }

    /// Gets the value for a key in the bucket.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let db = inner.db.clone().ok_or(Error::TxClosed)?;
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();

        if db.opts.entry_idx_mode == EntryIdxMode::HintBptSparse {
            return get_sparse(state, &db.opts, bucket, key);
        }

        let tree = state.indexes.btree.get(bucket).ok_or(Error::NotFoundBucket)?;
        let record = tree.get(key).ok_or(Error::NotFoundKey)?;
        if is_expired(record.hint.meta.ttl, record.hint.meta.timestamp) {
            return Err(Error::NotFoundKey);
        }
        record.value(&db.opts.dir)
    }

    // ------------------------------------------------------------------
    // List operations
    // ------------------------------------------------------------------

    /// Prepends values to the named list.
    pub fn lpush(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            PERSISTENT,
            Flag::LPush,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Appends values to the named list.
    pub fn rpush(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            PERSISTENT,
            Flag::RPush,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Removes and returns the head of the named list.
    pub fn lpop(&self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let value = self.list_end(bucket, key, false)?;
        self.push(
            bucket,
            key,
            &[],
            PERSISTENT,
            Flag::LPop,
            now_millis(),
            DataStructure::List,
        )?;
        Ok(value)
    }

    /// Removes and returns the tail of the named list.
    pub fn rpop(&self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let value = self.list_end(bucket, key, true)?;
        self.push(
            bucket,
            key,
            &[],
            PERSISTENT,
            Flag::RPop,
            now_millis(),
            DataStructure::List,
        )?;
        Ok(value)
    }

    /// Replaces the element at `index` in the named list.
    pub fn lset(&self, bucket: &str, key: &[u8], index: i64, value: &[u8]) -> Result<()> {
        let mut op_key = key.to_vec();
        op_key.push(LIST_KEY_SEP);
        op_key.extend_from_slice(index.to_string().as_bytes());
        self.push(
            bucket,
            &op_key,
            value,
            PERSISTENT,
            Flag::LSet,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Trims the named list to the elements in `[start, end]`.
    pub fn ltrim(&self, bucket: &str, key: &[u8], start: i64, end: i64) -> Result<()> {
        let mut op_key = key.to_vec();
        op_key.push(LIST_KEY_SEP);
        op_key.extend_from_slice(start.to_string().as_bytes());
        self.push(
            bucket,
            &op_key,
            end.to_string().as_bytes(),
            PERSISTENT,
            Flag::LTrim,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Removes up to `count` elements equal to `value` from the named
    /// list: positive counts scan from the head, negative from the tail,
    /// zero removes every match.
    pub fn lrem(&self, bucket: &str, key: &[u8], count: i64, value: &[u8]) -> Result<()> {
        let mut payload = count.to_string().into_bytes();
        payload.push(LIST_KEY_SEP);
        payload.extend_from_slice(value);
        self.push(
            bucket,
            key,
            &payload,
            PERSISTENT,
            Flag::LRem,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Removes the elements at the given indexes from the named list.
    pub fn lrem_by_index(&self, bucket: &str, key: &[u8], indexes: &[i64]) -> Result<()> {
        let payload = bincode::serialize(indexes)?;
        self.push(
            bucket,
            key,
            &payload,
            PERSISTENT,
            Flag::LRemByIndex,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Sets a TTL on the whole named list.
    pub fn expire_list(&self, bucket: &str, key: &[u8], ttl: u32) -> Result<()> {
        self.push(
            bucket,
            key,
            ttl.to_string().as_bytes(),
            PERSISTENT,
            Flag::ExpireList,
            now_millis(),
            DataStructure::List,
        )
    }

    /// Values in `[start, end]` of the named list (inclusive, negatives
    /// from the tail).
    pub fn lrange(&self, bucket: &str, key: &[u8], start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        let db = inner.db.clone().ok_or(Error::TxClosed)?;
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();

        let list = state.indexes.lists.get(bucket).ok_or(Error::NotFoundBucket)?;
        if list.expired(key) {
            return Err(Error::NotFoundKey);
        }
        list.lrange(key, start, end)
            .into_iter()
            .map(|record| record.value(&db.opts.dir))
            .collect()
    }

    fn list_end(&self, bucket: &str, key: &[u8], tail: bool) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let db = inner.db.clone().ok_or(Error::TxClosed)?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();

        let list = state.indexes.lists.get(bucket).ok_or(Error::NotFoundBucket)?;
        if list.expired(key) {
            return Err(Error::NotFoundKey);
        }
        let (start, end) = if tail { (-1, -1) } else { (0, 0) };
        let records = list.lrange(key, start, end);
        let record = records.first().ok_or(Error::NotFoundKey)?;
        record.value(&db.opts.dir)
    }

    // ------------------------------------------------------------------
    // Set operations
    // ------------------------------------------------------------------

    /// Adds a member to the named set.
    pub fn sadd(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            PERSISTENT,
            Flag::Set,
            now_millis(),
            DataStructure::Set,
        )
    }

    /// Removes a member from the named set.
    pub fn srem(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            PERSISTENT,
            Flag::Delete,
            now_millis(),
            DataStructure::Set,
        )
    }

    /// Whether `value` is a member of the named set.
    pub fn sismember(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<bool> {
        let inner = self.inner.lock();
        inner.db.as_ref().ok_or(Error::TxClosed)?;
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();
        let set = state.indexes.sets.get(bucket).ok_or(Error::NotFoundBucket)?;
        Ok(set.sismember(key, value))
    }

    /// All members of the named set.
    pub fn smembers(&self, bucket: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.db.as_ref().ok_or(Error::TxClosed)?;
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();
        let set = state.indexes.sets.get(bucket).ok_or(Error::NotFoundBucket)?;
        Ok(set.smembers(key).into_iter().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Sorted-set operations
    // ------------------------------------------------------------------

    /// Adds a member with the given score to the named sorted set.
    pub fn zadd(&self, bucket: &str, key: &[u8], score: f64, value: &[u8]) -> Result<()> {
        let mut op_key = key.to_vec();
        op_key.push(ZSET_KEY_SEP);
        op_key.extend_from_slice(score.to_string().as_bytes());
        self.push(
            bucket,
            &op_key,
            value,
            PERSISTENT,
            Flag::ZAdd,
            now_millis(),
            DataStructure::SortedSet,
        )
    }

    /// Removes a member from the named sorted set.
    pub fn zrem(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(
            bucket,
            key,
            value,
            PERSISTENT,
            Flag::ZRem,
            now_millis(),
            DataStructure::SortedSet,
        )
    }

    /// Removes members by ascending rank, 1-based and inclusive.
    pub fn zrem_range_by_rank(&self, bucket: &str, key: &[u8], start: i64, end: i64) -> Result<()> {
        let mut payload = start.to_string().into_bytes();
        payload.push(ZSET_KEY_SEP);
        payload.extend_from_slice(end.to_string().as_bytes());
        self.push(
            bucket,
            key,
            &payload,
            PERSISTENT,
            Flag::ZRemRangeByRank,
            now_millis(),
            DataStructure::SortedSet,
        )
    }

    /// Removes and returns the highest-scored member.
    pub fn zpop_max(&self, bucket: &str, key: &[u8]) -> Result<(f64, Vec<u8>)> {
        let popped = self.zset_end(bucket, key, true)?;
        self.push(
            bucket,
            key,
            &[],
            PERSISTENT,
            Flag::ZPopMax,
            now_millis(),
            DataStructure::SortedSet,
        )?;
        Ok(popped)
    }

    /// Removes and returns the lowest-scored member.
    pub fn zpop_min(&self, bucket: &str, key: &[u8]) -> Result<(f64, Vec<u8>)> {
        let popped = self.zset_end(bucket, key, false)?;
        self.push(
            bucket,
            key,
            &[],
            PERSISTENT,
            Flag::ZPopMin,
            now_millis(),
            DataStructure::SortedSet,
        )?;
        Ok(popped)
    }

    /// Members of the named sorted set in ascending score order.
    pub fn zrange(&self, bucket: &str, key: &[u8]) -> Result<Vec<(f64, Vec<u8>)>> {
        let inner = self.inner.lock();
        inner.db.as_ref().ok_or(Error::TxClosed)?;
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();
        let zset = state
            .indexes
            .sorted_sets
            .get(bucket)
            .ok_or(Error::NotFoundBucket)?;
        Ok(zset.zrange(key))
    }

    fn zset_end(&self, bucket: &str, key: &[u8], max: bool) -> Result<(f64, Vec<u8>)> {
        let inner = self.inner.lock();
        inner.db.as_ref().ok_or(Error::TxClosed)?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        let state = inner.guard.as_ref().ok_or(Error::TxClosed)?.state();
        let zset = state
            .indexes
            .sorted_sets
            .get(bucket)
            .ok_or(Error::NotFoundBucket)?;
        let popped = if max {
            zset.peek_max(key)
        } else {
            zset.peek_min(key)
        };
        popped.ok_or(Error::NotFoundKey)
    }

    // ------------------------------------------------------------------
    // Bucket deletion
    // ------------------------------------------------------------------

    /// Queues deletion of a whole bucket of the given data-structure kind.
    pub fn delete_bucket(&self, ds: DataStructure, bucket: &str) -> Result<()> {
        let flag = match ds {
            DataStructure::Tree => Flag::BPTreeBucketDelete,
            DataStructure::Set => Flag::SetBucketDelete,
            DataStructure::SortedSet => Flag::SortedSetBucketDelete,
            DataStructure::List => Flag::ListBucketDelete,
            DataStructure::None => return Err(Error::NotFoundBucket),
        };
        self.push_raw(
            bucket,
            &[],
            &[],
            PERSISTENT,
            flag,
            now_millis(),
            DataStructure::None,
        )
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Commits the transaction: serializes pending writes to the active
    /// segment (rotating as needed), stamps the last entry Committed, and
    /// updates the in-memory indexes. The transaction ends Closed and the
    /// database lock is released whether or not the commit succeeds.
    pub fn commit(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::CannotCommitAClosedTx);
        }

        let mut inner = self.inner.lock();
        let Some(db) = inner.db.clone() else {
            self.set_status(TX_STATUS_CLOSED);
            return Err(Error::DbClosed);
        };

        self.set_status(TX_STATUS_COMMITTING);
        let result = write_pending(&mut inner, &db);

        // The error handler runs before the lock is released.
        if let Err(err) = &result {
            if let Some(handler) = &db.opts.error_handler {
                handler.handle_error(err);
            }
        }

        self.set_status(TX_STATUS_CLOSED);
        inner.db = None;
        inner.pending_writes = Vec::new();
        inner.reserved_tx_id_idxes = HashMap::new();
        inner.size = 0;
        inner.guard = None;

        result
    }

    /// Closes the transaction without committing. Legal only while the
    /// transaction is still Running.
    pub fn rollback(&self) -> Result<()> {
        if self.is_committing() {
            return Err(Error::CannotRollbackACommittingTx);
        }
        if self.is_closed() {
            return Err(Error::CannotRollbackAClosedTx);
        }

        let mut inner = self.inner.lock();
        if inner.db.is_none() {
            self.set_status(TX_STATUS_CLOSED);
            return Err(Error::DbClosed);
        }

        self.set_status(TX_STATUS_CLOSED);
        inner.db = None;
        inner.pending_writes = Vec::new();
        inner.reserved_tx_id_idxes = HashMap::new();
        inner.size = 0;
        inner.guard = None;

        Ok(())
    }

    /// Submits the transaction to the commit dispatcher and delivers the
    /// result to `callback` from a background worker, so the callback
    /// never runs under locks the caller may hold.
    pub fn commit_with<F>(self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let empty = self.inner.lock().pending_writes.is_empty();
        if empty {
            // Nothing to dispatch; still close the transaction so the
            // database lock is released, then report success.
            std::thread::spawn(move || {
                let result = self.commit();
                callback(result);
            });
            return;
        }

        let db = self.inner.lock().db.clone();
        let Some(db) = db else {
            std::thread::spawn(move || callback(Err(Error::TxClosed)));
            return;
        };

        match db.dispatcher.submit(self) {
            Ok(waiter) => {
                std::thread::spawn(move || callback(waiter.wait()));
            }
            Err(tx) => {
                let _ = tx.rollback();
                std::thread::spawn(move || callback(Err(Error::DbClosed)));
            }
        }
    }
}

// ----------------------------------------------------------------------
// Commit internals
// ----------------------------------------------------------------------

fn write_pending(inner: &mut TxInner, db: &Arc<DbCore>) -> Result<()> {
    if inner.pending_writes.is_empty() {
        return Ok(());
    }

    let mut pending = std::mem::take(&mut inner.pending_writes);
    let total_size: u64 = pending.iter().map(|e| e.size()).sum();

    let Some(StateGuard::Write(guard)) = inner.guard.as_mut() else {
        return Err(Error::TxNotWritable);
    };
    let state: &mut DbState = &mut *guard;
    let reserved = &mut inner.reserved_tx_id_idxes;

    // Small commits share the process-wide buffer; large ones take a
    // private buffer so the shared one never grows past the threshold.
    let use_shared = total_size < db.opts.commit_buffer_size;
    let mut buf = if use_shared {
        std::mem::take(&mut state.commit_buffer)
    } else {
        Vec::with_capacity(total_size as usize)
    };
    buf.clear();

    let result = commit_entries(state, reserved, db, &mut pending, &mut buf);

    if use_shared {
        buf.clear();
        state.commit_buffer = buf;
    }
    result
}

fn commit_entries(
    state: &mut DbState,
    reserved: &mut HashMap<u64, BPTree>,
    db: &DbCore,
    pending: &mut [Entry],
    buf: &mut Vec<u8>,
) -> Result<()> {
    let opts = &db.opts;
    let sparse = opts.entry_idx_mode == EntryIdxMode::HintBptSparse;
    let last = pending.len() - 1;
    let mut scratch_meta: Option<BucketMeta> = None;

    for i in 0..pending.len() {
        let entry_size = pending[i].size();
        if entry_size > opts.segment_size {
            return Err(Error::DataSizeExceed);
        }

        // No entry spans two segments: flush what is buffered and rotate
        // before this entry is encoded.
        if state.active_file.actual_size + buf.len() as u64 + entry_size > opts.segment_size {
            write_data(state, opts, buf)?;
            buf.clear();
            rotate_active_file(state, reserved, opts)?;
        }

        // The entry's final on-disk position.
        let offset = state.active_file.write_off + buf.len() as u64;

        if sparse && pending[i].meta.ds == DataStructure::Tree {
            let key = namespaced_key(&pending[i].bucket, &pending[i].key);
            state.bptree_key_pos.insert(key, offset);
        }

        if i == last {
            pending[i].meta.status = Status::Committed;
        }

        pending[i].encode_into(buf)?;

        if i == last {
            write_data(state, opts, buf)?;
        }

        let entry = &pending[i];
        let bucket = String::from_utf8_lossy(&entry.bucket).into_owned();

        if sparse && entry.meta.ds == DataStructure::Tree {
            scratch_meta = Some(BucketMeta::observe(scratch_meta.take(), &entry.key));
        }

        if i == last && sparse {
            build_tx_id_root_idx(state, reserved, opts, entry.meta.tx_id)?;
            if let Some(scratch) = &scratch_meta {
                build_bucket_meta_idx(state, opts, &bucket, scratch)?;
            }
        }

        let hint = Hint {
            file_id: state.active_file.file_id,
            key: entry.key.clone(),
            meta: entry.meta,
            data_pos: offset,
        };
        let record = Record {
            bucket,
            value: Some(entry.value.clone()),
            hint,
        };
        state.apply_entry_record(record, opts, &db.ttl);
    }

    build_not_ds_idxes(state, pending);
    Ok(())
}

/// Flushes buffered bytes to the active segment at its current end.
fn write_data(state: &mut DbState, opts: &Options, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    let write_offset = state.active_file.actual_size;
    if write_offset + data.len() as u64 > opts.segment_size {
        return Err(Error::InvalidData("not enough file space".to_string()));
    }

    let n = state.active_file.write_at(data, write_offset)?;
    state.active_file.write_off += data.len() as u64;
    state.active_file.actual_size += data.len() as u64;

    if opts.sync_enable {
        state.active_file.sync()?;
    }
    Ok(n)
}

/// Rotates the active segment when it cannot fit a pending entry.
fn rotate_active_file(
    state: &mut DbState,
    reserved: &mut HashMap<u64, BPTree>,
    opts: &Options,
) -> Result<()> {
    let f_id = state.max_file_id;
    state.max_file_id += 1;

    if !opts.sync_enable && opts.rw_mode == RwMode::Mmap {
        state.active_file.sync()?;
    }
    state.active_file.release()?;

    if opts.entry_idx_mode == EntryIdxMode::HintBptSparse {
        let key_pos = std::mem::take(&mut state.bptree_key_pos);
        state.active_bptree.set_key_pos_map(key_pos);
        let root_off = state
            .active_bptree
            .write_nodes(&bpt_path(&opts.dir, f_id), opts.sync_enable)?;

        let root_idx = BPTreeRootIdx {
            root_off,
            f_id,
            start: state.active_bptree.first_key().cloned().unwrap_or_default(),
            end: state.active_bptree.last_key().cloned().unwrap_or_default(),
        };
        root_idx.persist(&bpt_root_path(&opts.dir, f_id), opts.sync_enable)?;
        state.bptree_root_idxes.push(root_idx);
        state.active_bptree = BPTree::new();

        // The committed-TxID tree for the finished segment is parked on
        // the transaction and persisted by the next commit.
        reserved.insert(
            f_id,
            std::mem::replace(&mut state.active_committed_tx_ids, BPTree::new()),
        );
    }

    state.active_file = DataFile::open(
        &opts.dir,
        state.max_file_id,
        opts.segment_size,
        opts.rw_mode,
    )?;
    Ok(())
}

/// Records the committing TxID in the active committed-TxID tree and
/// persists any trees reserved at rotation, each with a root-address
/// record.
fn build_tx_id_root_idx(
    state: &mut DbState,
    reserved: &mut HashMap<u64, BPTree>,
    opts: &Options,
    tx_id: u64,
) -> Result<()> {
    let key = tx_id.to_string().into_bytes();
    let marker = tx_id_marker(&key, tx_id);
    state.active_committed_tx_ids.insert(key.clone(), marker.clone());

    for (f_id, tree) in reserved.iter_mut() {
        tree.insert(key.clone(), marker.clone());
        tree.write_nodes(&bpt_tx_id_path(&opts.dir, *f_id), opts.sync_enable)?;

        let root_address = tree.root_address().unwrap_or(0).to_string().into_bytes();
        let mut root_tree = BPTree::new();
        root_tree.insert(root_address.clone(), tx_id_marker(&root_address, tx_id));
        root_tree.write_nodes(&bpt_root_tx_id_path(&opts.dir, *f_id), opts.sync_enable)?;
    }
    Ok(())
}

pub(crate) fn tx_id_marker(key: &[u8], tx_id: u64) -> Hint {
    Hint {
        file_id: 0,
        key: key.to_vec(),
        meta: MetaData {
            timestamp: 0,
            ttl: PERSISTENT,
            flag: Flag::Set,
            ds: DataStructure::None,
            status: Status::Committed,
            tx_id,
            bucket_size: 0,
            key_size: key.len() as u32,
            value_size: 0,
        },
        data_pos: 0,
    }
}

/// Widens and rewrites the persisted bucket meta if this batch extended
/// the bucket's key range.
fn build_bucket_meta_idx(
    state: &mut DbState,
    opts: &Options,
    bucket: &str,
    scratch: &BucketMeta,
) -> Result<()> {
    let merged = match state.bucket_metas.get(bucket) {
        None => Some(scratch.clone()),
        Some(existing) => {
            let mut meta = existing.clone();
            if meta.widen(scratch) {
                Some(meta)
            } else {
                None
            }
        }
    };

    if let Some(meta) = merged {
        meta.persist(&bucket_meta_path(&opts.dir, bucket), opts.sync_enable)?;
        state.bucket_metas.insert(bucket.to_string(), meta);
    }
    Ok(())
}

/// Processes bucket-deletion entries and counts keys, after the per-entry
/// index updates.
fn build_not_ds_idxes(state: &mut DbState, pending: &[Entry]) {
    for entry in pending {
        if entry.meta.ds == DataStructure::None {
            let bucket = String::from_utf8_lossy(&entry.bucket).into_owned();
            match entry.meta.flag {
                Flag::BPTreeBucketDelete => state.indexes.delete_bucket(DataStructure::Tree, &bucket),
                Flag::SetBucketDelete => state.indexes.delete_bucket(DataStructure::Set, &bucket),
                Flag::SortedSetBucketDelete => {
                    state.indexes.delete_bucket(DataStructure::SortedSet, &bucket)
                }
                Flag::ListBucketDelete => state.indexes.delete_bucket(DataStructure::List, &bucket),
                _ => {}
            }
        }
        state.key_count += 1;
    }
}

/// Sparse-mode point lookup: the active tree first, then persisted
/// per-segment trees newest-first, keyed by their root records.
fn get_sparse(state: &DbState, opts: &Options, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
    let nk = namespaced_key(bucket.as_bytes(), key);

    if let Some(hint) = state.active_bptree.get(&nk) {
        if hint.meta.flag == Flag::Delete || is_expired(hint.meta.ttl, hint.meta.timestamp) {
            return Err(Error::NotFoundKey);
        }
        let entry = data_file::read_entry_at(&opts.dir, hint.file_id, hint.data_pos)?;
        return Ok(entry.value);
    }

    for root in state.bptree_root_idxes.iter().rev() {
        if nk < root.start || nk > root.end {
            continue;
        }
        let path = bpt_path(&opts.dir, root.f_id);
        if let Some((file_id, data_pos)) =
            crate::bptree::disk::search(&path, root.root_off, &nk)?
        {
            let entry = data_file::read_entry_at(&opts.dir, file_id, data_pos)?;
            if entry.meta.flag == Flag::Delete || is_expired(entry.meta.ttl, entry.meta.timestamp) {
                return Err(Error::NotFoundKey);
            }
            return Ok(entry.value);
        }
    }

    Err(Error::NotFoundKey)
}
