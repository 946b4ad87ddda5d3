//! Bookkeeping for `soleak`.
//!
//! Everything here is plain data structures: the sharded [`AllocLedger`],
//! the [`FdLedger`], stack capture and symbolization, and the renderers
//! that turn ledger snapshots into text reports and JSON. Nothing in this
//! crate intercepts anything; the `interpose` crate feeds it.
//!
//! > The ledgers are called from inside `malloc`. Any heap allocation
//! > they make re-enters the allocator, so callers must make sure a
//! > re-entrant call is not booked again (see the wrappers' guard).

pub mod utils;
pub mod stack;
pub mod record;
pub mod alloc;
pub mod fd;
pub mod report;
pub mod json;

pub use utils::{DumpError, FreePolicy, LedgerError, Tally};
pub use stack::{Capturer, Frame, Stack, Symbolizer, DEFAULT_MAX_FRAMES, MAX_FRAMES_LIMIT};
pub use record::{AllocationRecord, FdKey, FdRecord, UNKNOWN_PATH, mode_to_flags};
pub use alloc::{AllocLedger, MemorySnapshot, MemoryStats, ReallocOutcome, ShardStats, SHARDS};
pub use fd::{FdLedger, FdSnapshot, FdStats};
pub use json::{FdLeakEntry, LeakEntry, LeakGroup};
