use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Error;

/// File I/O mode for segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    /// Standard positional file I/O.
    FileIo,
    /// Memory-mapped segment files.
    Mmap,
}

/// How entry indexes keep track of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryIdxMode {
    /// Keys and values are both retained in memory alongside the hint.
    HintKeyValAndRam,
    /// Only keys and hints are retained; values are fetched from disk.
    HintKey,
    /// Sparse mode: per-segment B+-trees are persisted to disk and the
    /// in-memory index holds only the active segment's keys.
    HintBptSparse,
}

/// Callback invoked with the commit error before transaction resources
/// are released.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, err: &Error);
}

impl<F> ErrorHandler for F
where
    F: Fn(&Error) + Send + Sync,
{
    fn handle_error(&self, err: &Error) {
        self(err)
    }
}

/// Configuration for an EmberDB instance.
#[derive(Clone)]
pub struct Options {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// Bytes per segment file (default: 8MB).
    pub segment_size: u64,

    /// Threshold below which commits reuse the shared commit buffer
    /// (default: 4MB). Larger transactions allocate a private buffer.
    pub commit_buffer_size: u64,

    /// Fsync after every append and after meta writes (default: false).
    pub sync_enable: bool,

    /// Segment file I/O mode (default: FileIo).
    pub rw_mode: RwMode,

    /// Entry index mode (default: HintKeyValAndRam).
    pub entry_idx_mode: EntryIdxMode,

    /// Node identifier for the transaction ID generator, to avoid
    /// collisions between instances (default: 0).
    pub node_num: u16,

    /// Maximum number of pending writes per transaction.
    pub max_batch_count: u64,

    /// Maximum total byte size of pending writes per transaction.
    pub max_batch_size: u64,

    /// Callback invoked on commit errors before resources are released.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("commit_buffer_size", &self.commit_buffer_size)
            .field("sync_enable", &self.sync_enable)
            .field("rw_mode", &self.rw_mode)
            .field("entry_idx_mode", &self.entry_idx_mode)
            .field("node_num", &self.node_num)
            .field("max_batch_count", &self.max_batch_count)
            .field("max_batch_size", &self.max_batch_size)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

const DEFAULT_SEGMENT_SIZE: u64 = 8 * 1024 * 1024; // 8MB

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            commit_buffer_size: 4 * 1024 * 1024, // 4MB
            sync_enable: false,
            rw_mode: RwMode::FileIo,
            entry_idx_mode: EntryIdxMode::HintKeyValAndRam,
            node_num: 0,
            max_batch_count: 20_000,
            max_batch_size: 15 * DEFAULT_SEGMENT_SIZE / 4,
            error_handler: None,
        }
    }
}

impl Options {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set bytes per segment file.
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the shared commit buffer threshold.
    pub fn commit_buffer_size(mut self, size: u64) -> Self {
        self.commit_buffer_size = size;
        self
    }

    /// Enable fsync after every append and meta write.
    pub fn sync_enable(mut self, enabled: bool) -> Self {
        self.sync_enable = enabled;
        self
    }

    /// Set the segment file I/O mode.
    pub fn rw_mode(mut self, mode: RwMode) -> Self {
        self.rw_mode = mode;
        self
    }

    /// Set the entry index mode.
    pub fn entry_idx_mode(mut self, mode: EntryIdxMode) -> Self {
        self.entry_idx_mode = mode;
        self
    }

    /// Set the node identifier for the transaction ID generator.
    pub fn node_num(mut self, node: u16) -> Self {
        self.node_num = node;
        self
    }

    /// Set the maximum number of pending writes per transaction.
    pub fn max_batch_count(mut self, count: u64) -> Self {
        self.max_batch_count = count;
        self
    }

    /// Set the maximum total byte size of pending writes per transaction.
    pub fn max_batch_size(mut self, size: u64) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Install a commit error handler.
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let opts = Options::default();
        assert_eq!(opts.dir, PathBuf::from("./emberdb"));
        assert_eq!(opts.segment_size, 8 * 1024 * 1024);
        assert!(!opts.sync_enable);
        assert_eq!(opts.rw_mode, RwMode::FileIo);
        assert_eq!(opts.entry_idx_mode, EntryIdxMode::HintKeyValAndRam);
        assert!(opts.error_handler.is_none());
    }

    #[test]
    fn test_config_builder() {
        let opts = Options::new("/tmp/test")
            .segment_size(1024)
            .sync_enable(true)
            .rw_mode(RwMode::Mmap)
            .entry_idx_mode(EntryIdxMode::HintKey)
            .max_batch_count(16)
            .max_batch_size(4096);

        assert_eq!(opts.dir, PathBuf::from("/tmp/test"));
        assert_eq!(opts.segment_size, 1024);
        assert!(opts.sync_enable);
        assert_eq!(opts.rw_mode, RwMode::Mmap);
        assert_eq!(opts.entry_idx_mode, EntryIdxMode::HintKey);
        assert_eq!(opts.max_batch_count, 16);
        assert_eq!(opts.max_batch_size, 4096);
    }
}
