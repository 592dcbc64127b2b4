//! Explicit runtime/policy context. A handful of `lazy_static`/
//! `mut_static` globals remain below, but only for the values a
//! `fuser::Filesystem` callback or an `extern "C"` signal handler truly
//! cannot receive as an argument (the mountpoint and device path the
//! `SIGINT` handler needs to unmount, and the force-format flag);
//! everything else lives on [`Runtime`]/[`VolumePolicy`] and is threaded
//! explicitly.
use lazy_static::lazy_static;
use mut_static::MutStatic;

lazy_static! {
    pub static ref MOUNT_POINT: MutStatic<String> = MutStatic::new();
    pub static ref DEVICE_FILE: MutStatic<String> = MutStatic::new();
    pub static ref FORCE_FORMAT: MutStatic<bool> = MutStatic::new();
}

/// Mount-time selection of the traversal strategy used for recovery and
/// explicit rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalStrategy {
    Backward,
    Forward,
    Rollback(u64),
}

impl Default for TraversalStrategy {
    fn default() -> Self {
        TraversalStrategy::Backward
    }
}

/// Index-partition placement criteria (/ `index_criteria.h`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPartitionCriteria {
    pub have_criteria: bool,
    pub max_filesize_criteria: u64,
    pub glob_patterns: Vec<String>,
}

impl Default for IndexPartitionCriteria {
    fn default() -> Self {
        Self {
            have_criteria: false,
            max_filesize_criteria: 0,
            glob_patterns: Vec::new(),
        }
    }
}

/// Everything that used to be a global in the source implementation,
/// gathered into one struct threaded through C6–C10.
#[derive(Debug, Clone)]
pub struct VolumePolicy {
    pub traversal: TraversalStrategy,
    pub index_criteria: IndexPartitionCriteria,
    /// Minimum/maximum outstanding write-buffer pool size, in bytes.
    pub min_pool_size: u64,
    pub max_pool_size: u64,
    /// Periodic sync interval; `None` disables the timer trigger.
    pub sync_interval: Option<std::time::Duration>,
    /// Whether atime-only dirtiness alone should trigger a new generation.
    pub use_atime: bool,
    pub read_only: bool,
    pub recover_extra: bool,
}

impl Default for VolumePolicy {
    fn default() -> Self {
        Self {
            traversal: TraversalStrategy::default(),
            index_criteria: IndexPartitionCriteria::default(),
            min_pool_size: 16 * 1024 * 1024,
            max_pool_size: 256 * 1024 * 1024,
            sync_interval: Some(std::time::Duration::from_secs(300)),
            use_atime: false,
            read_only: false,
            recover_extra: true,
        }
    }
}

/// Process-wide knobs that are not per-volume policy (log level, trace).
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    pub policy: VolumePolicy,
}
