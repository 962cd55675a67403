//! Database context: shared state, options, the DB-level lock, the active
//! segment, and the open/recover/close lifecycle.
//!
//! All mutable engine state lives in [`DbState`] behind a single
//! readers-writer lock. Writable transactions take the lock exclusively;
//! read transactions share it. Startup recovery replays the segment files
//! through the same index-application path the commit uses.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bptree::disk::BPTreeRootIdx;
use crate::bptree::BPTree;
use crate::bucket_meta::BucketMeta;
use crate::config::{EntryIdxMode, Options};
use crate::data_file::{data_file_path, DataFile};
use crate::dispatcher::CommitDispatcher;
use crate::entry::{now_millis, DataStructure, Entry, Flag, MetaData, Status, PERSISTENT};
use crate::error::{Error, Result};
use crate::flock::DirLock;
use crate::index::{namespaced_key, reset_record_by_mode, Hint, Indexes, Record};
use crate::ttl::TtlManager;
use crate::tx::Tx;
use crate::tx_id::TxIdGenerator;

/// All mutable engine state, guarded by the DB lock.
pub(crate) struct DbState {
    pub(crate) active_file: DataFile,
    pub(crate) max_file_id: u64,
    pub(crate) key_count: u64,
    pub(crate) indexes: Indexes,

    // Sparse index mode.
    pub(crate) active_bptree: BPTree,
    pub(crate) active_committed_tx_ids: BPTree,
    pub(crate) bptree_key_pos: HashMap<Vec<u8>, u64>,
    pub(crate) bptree_root_idxes: Vec<BPTreeRootIdx>,
    pub(crate) bucket_metas: HashMap<String, BucketMeta>,

    /// Process-wide scratch buffer reused by small commits.
    pub(crate) commit_buffer: Vec<u8>,
}

impl DbState {
    /// Applies one committed entry's record to the in-memory indexes.
    /// Shared by the commit loop and the startup recovery scan.
    pub(crate) fn apply_entry_record(&mut self, record: Record, opts: &Options, ttl: &TtlManager) {
        match record.hint.meta.ds {
            DataStructure::Tree => {
                if opts.entry_idx_mode == EntryIdxMode::HintBptSparse {
                    let key = namespaced_key(record.bucket.as_bytes(), &record.hint.key);
                    let hint = Hint {
                        file_id: record.hint.file_id,
                        key: key.clone(),
                        meta: record.hint.meta,
                        data_pos: record.hint.data_pos,
                    };
                    self.active_bptree.insert(key, hint);
                } else {
                    self.build_tree_idx(record, opts, ttl);
                }
            }
            DataStructure::List | DataStructure::Set | DataStructure::SortedSet => {
                self.indexes
                    .apply_record(record, opts.entry_idx_mode, &opts.dir);
            }
            DataStructure::None => {}
        }
    }

    fn build_tree_idx(&mut self, mut record: Record, opts: &Options, ttl: &TtlManager) {
        let meta = record.hint.meta;
        let bucket = record.bucket.clone();
        let key = record.hint.key.clone();

        match meta.flag {
            Flag::Set => {
                if !schedule_ttl(ttl, &bucket, &key, &meta) {
                    return;
                }
                reset_record_by_mode(&mut record, opts.entry_idx_mode);
                self.indexes
                    .btree
                    .entry(bucket)
                    .or_default()
                    .insert(key, record);
            }
            Flag::Delete => {
                ttl.del(&bucket, &key);
                if let Some(tree) = self.indexes.btree.get_mut(&bucket) {
                    tree.remove(&key);
                }
            }
            _ => {}
        }
    }
}

/// Schedules (or cancels) the expiry delete for a Tree-ds Set entry.
/// Returns false when the entry is already expired and must be skipped.
fn schedule_ttl(ttl_mgr: &TtlManager, bucket: &str, key: &[u8], meta: &MetaData) -> bool {
    if meta.ttl == PERSISTENT {
        ttl_mgr.del(bucket, key);
        return true;
    }

    let now = now_millis();
    let expire_at = meta.timestamp + u64::from(meta.ttl) * 1000;
    if now > expire_at {
        return false;
    }
    ttl_mgr.add(
        bucket,
        key,
        std::time::Duration::from_millis(expire_at - now),
    );
    true
}

/// Shared core behind every transaction and worker.
pub(crate) struct DbCore {
    pub(crate) opts: Options,
    pub(crate) state: Arc<RwLock<DbState>>,
    pub(crate) closed: AtomicBool,
    pub(crate) tx_ids: TxIdGenerator,
    pub(crate) ttl: TtlManager,
    pub(crate) dispatcher: CommitDispatcher,
    _lock: DirLock,
}

impl DbCore {
    /// Runs `f` in a writable transaction, committing on success and
    /// rolling back on error.
    pub(crate) fn update<T>(self: &Arc<Self>, f: impl FnOnce(&Tx) -> Result<T>) -> Result<T> {
        let tx = Tx::begin(self, true)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }
}

/// An EmberDB instance.
pub struct Db {
    core: Arc<DbCore>,
}

impl Db {
    /// Opens (creating if needed) a database in `opts.dir`, recovering
    /// indexes from the segment files on disk.
    pub fn open(opts: Options) -> Result<Db> {
        fs::create_dir_all(&opts.dir)?;
        let lock = DirLock::acquire(&opts.dir)?;

        let ttl = TtlManager::new();
        let state = recover(&opts, &ttl)?;
        tracing::info!(
            dir = %opts.dir.display(),
            max_file_id = state.max_file_id,
            key_count = state.key_count,
            "Database opened"
        );

        let core = Arc::new(DbCore {
            tx_ids: TxIdGenerator::new(opts.node_num),
            state: Arc::new(RwLock::new(state)),
            closed: AtomicBool::new(false),
            ttl,
            dispatcher: CommitDispatcher::start()?,
            _lock: lock,
            opts,
        });
        core.ttl.bind(Arc::downgrade(&core))?;

        Ok(Db { core })
    }

    /// Opens a new transaction. Multiple read transactions may run
    /// concurrently, but only one writable transaction exists at a time;
    /// a second writable Begin blocks until the first closes.
    pub fn begin(&self, writable: bool) -> Result<Tx> {
        Tx::begin(&self.core, writable)
    }

    /// Runs `f` in a writable transaction, committing on success and
    /// rolling back on error.
    pub fn update<T>(&self, f: impl FnOnce(&Tx) -> Result<T>) -> Result<T> {
        self.core.update(f)
    }

    /// Runs `f` in a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx) -> Result<T>) -> Result<T> {
        let tx = self.begin(false)?;
        let result = f(&tx);
        let _ = tx.rollback();
        result
    }

    /// Stops background workers, syncs and releases the active segment,
    /// and marks the instance closed.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::DbClosed);
        }

        // Workers first: the dispatcher drains in-flight commits and the
        // TTL worker stops scheduling deletes before the segment goes away.
        self.core.ttl.shutdown();
        self.core.dispatcher.shutdown();

        let mut state = self.core.state.write();
        state.active_file.release()?;
        tracing::info!(dir = %self.core.opts.dir.display(), "Database closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// Number of committed entries applied to the indexes.
    pub fn key_count(&self) -> u64 {
        self.core.state.read().key_count
    }

    /// ID of the active segment file.
    pub fn max_file_id(&self) -> u64 {
        self.core.state.read().max_file_id
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<DbCore> {
        &self.core
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

// ----------------------------------------------------------------------
// Startup recovery
// ----------------------------------------------------------------------

/// Rebuilds engine state from the segment files: pass one collects the
/// TxIDs that reached a Committed marker, pass two replays exactly the
/// entries of those transactions into the indexes.
fn recover(opts: &Options, ttl: &TtlManager) -> Result<DbState> {
    let sparse = opts.entry_idx_mode == EntryIdxMode::HintBptSparse;

    let mut ids: Vec<u64> = Vec::new();
    for dirent in fs::read_dir(&opts.dir)? {
        let name = dirent?.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".dat") {
            if let Ok(id) = stem.parse() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();

    // Pass one: parse every segment, remembering where valid data ends.
    // A decode failure means a torn tail (or the zero fill of a mapped
    // segment); scanning stops there for that file.
    let mut committed: HashSet<u64> = HashSet::new();
    let mut parsed: Vec<(u64, u64, Entry)> = Vec::new();
    let mut tails: HashMap<u64, u64> = HashMap::new();
    for &file_id in &ids {
        let buf = fs::read(data_file_path(&opts.dir, file_id))?;
        let mut off = 0u64;
        while (off as usize) < buf.len() {
            match Entry::decode(&buf[off as usize..]) {
                Ok((entry, consumed)) => {
                    if entry.meta.status == Status::Committed {
                        committed.insert(entry.meta.tx_id);
                    }
                    parsed.push((file_id, off, entry));
                    off += consumed;
                }
                Err(_) => break,
            }
        }
        tails.insert(file_id, off);
    }

    let max_file_id = ids.last().copied().unwrap_or(0);
    let mut active_file = DataFile::open(&opts.dir, max_file_id, opts.segment_size, opts.rw_mode)?;
    let tail = tails.get(&max_file_id).copied().unwrap_or(0);
    active_file.write_off = tail;
    active_file.actual_size = tail;

    let mut state = DbState {
        active_file,
        max_file_id,
        key_count: 0,
        indexes: Indexes::new(),
        active_bptree: BPTree::new(),
        active_committed_tx_ids: BPTree::new(),
        bptree_key_pos: HashMap::new(),
        bptree_root_idxes: Vec::new(),
        bucket_metas: HashMap::new(),
        commit_buffer: Vec::with_capacity(opts.commit_buffer_size as usize),
    };

    if sparse {
        load_sparse_files(opts, &mut state)?;
    }

    // Pass two: replay committed entries in log order.
    for (file_id, off, entry) in parsed {
        if !committed.contains(&entry.meta.tx_id) {
            continue;
        }

        if sparse && file_id == max_file_id {
            // The active segment's committed TxIDs feed the next
            // rotation's reserved-tree persistence.
            let key = entry.meta.tx_id.to_string().into_bytes();
            if !state.active_committed_tx_ids.contains(&key) {
                let marker = crate::tx::tx_id_marker(&key, entry.meta.tx_id);
                state.active_committed_tx_ids.insert(key, marker);
            }
        }

        if sparse && entry.meta.ds == DataStructure::Tree {
            if file_id != max_file_id {
                // Older segments are served by their persisted trees.
                state.key_count += 1;
                continue;
            }
            let key = namespaced_key(&entry.bucket, &entry.key);
            state.bptree_key_pos.insert(key, off);
        }

        let bucket = String::from_utf8_lossy(&entry.bucket).into_owned();

        if entry.meta.ds == DataStructure::None {
            match entry.meta.flag {
                Flag::BPTreeBucketDelete => {
                    state.indexes.delete_bucket(DataStructure::Tree, &bucket)
                }
                Flag::SetBucketDelete => state.indexes.delete_bucket(DataStructure::Set, &bucket),
                Flag::SortedSetBucketDelete => state
                    .indexes
                    .delete_bucket(DataStructure::SortedSet, &bucket),
                Flag::ListBucketDelete => {
                    state.indexes.delete_bucket(DataStructure::List, &bucket)
                }
                _ => {}
            }
            state.key_count += 1;
            continue;
        }

        let record = Record {
            bucket,
            hint: Hint {
                file_id,
                key: entry.key.clone(),
                meta: entry.meta,
                data_pos: off,
            },
            value: Some(entry.value),
        };
        state.apply_entry_record(record, opts, ttl);
        state.key_count += 1;
    }

    Ok(state)
}

/// Loads the sparse-mode auxiliary files: per-segment root records and
/// bucket metas.
fn load_sparse_files(opts: &Options, state: &mut DbState) -> Result<()> {
    for dirent in fs::read_dir(&opts.dir)? {
        let path = dirent?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        if name.starts_with("BPTRoot-") {
            match BPTreeRootIdx::load(&path) {
                Ok(idx) => state.bptree_root_idxes.push(idx),
                Err(e) => tracing::warn!(file = %name, error = %e, "Skipping bad root record"),
            }
        } else if let Some(bucket) = name.strip_prefix("bucketMeta-") {
            match BucketMeta::load(&path) {
                Ok(meta) => {
                    state.bucket_metas.insert(bucket.to_string(), meta);
                }
                Err(e) => tracing::warn!(file = %name, error = %e, "Skipping bad bucket meta"),
            }
        }
    }
    state.bptree_root_idxes.sort_by_key(|r| r.f_id);
    Ok(())
}
