pub use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    hash::BuildHasherDefault,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
    fmt,
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use indexmap::IndexMap;
pub use ahash::AHasher;

/// Byte counts and event counts alike are kept in 64 bits, regardless
/// of the target's pointer width. A 32-bit process can still free more
/// than 4 GiB over its lifetime.
pub type Tally = u64;

/// Insertion-ordered map with a fast, non-cryptographic hasher. Every
/// live-record book in this crate is one of these: iteration follows
/// insertion order, which keeps reports and JSON deterministic.
pub type FastMap<K, V> = IndexMap<K, V, BuildHasherDefault<AHasher>>;

/// Locks a mutex, ignoring poisoning.
///
/// Bookkeeping runs inline with the intercepted call. If some thread
/// panicked while holding a ledger lock, the data it protects is still
/// a valid map plus counters; refusing to touch it would only turn one
/// lost record into a dead tracker.
#[inline(always)]
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Milliseconds since the Unix epoch. Zero if the clock is set before it.
#[inline]
pub fn now_millis() -> Tally {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Tally)
        .unwrap_or(0)
}

/// What to do with a `free`/`close` whose target was never tracked
/// (allocated before hooking, foreign, or already released).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FreePolicy {
    /// Count the release anyway: the free counter goes up by one and
    /// the freed-bytes counter by zero. `totalFreeCount` may therefore
    /// exceed `totalAllocCount`. This is a known relaxation, kept so
    /// that the wrappers never have to branch away from the real call.
    #[default]
    Permissive,
    /// Leave all counters untouched and log the mismatch.
    Strict,
}

impl FreePolicy {
    pub fn counts_untracked(&self) -> bool {
        matches!(self, FreePolicy::Permissive)
    }
}

impl std::str::FromStr for FreePolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive"    => Ok(FreePolicy::Permissive),
            "strict"        => Ok(FreePolicy::Strict),
            other           => Err(LedgerError::BadPolicy(other.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("unknown free policy `{0}` (expected `permissive` or `strict`)")]
    BadPolicy(String),
}

/// Appears when a report cannot be written to disk.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("no destination path given")]
    EmptyPath,
    #[error("destination directory of {0:?} does not exist")]
    MissingParent(PathBuf),
    #[error("failed to write report to {path:?}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
}
