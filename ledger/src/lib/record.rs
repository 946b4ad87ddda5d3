use crate::utils::*;
use crate::stack::Stack;
use std::os::raw::c_int;

/// One live heap block, as seen through an intercepted allocation.
///
/// Records are owned exclusively by the ledger entry for their pointer.
/// Queries only ever see clones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub ptr:        usize,
    pub size:       Tally,
    /// Ledger-wide monotonic sequence number.
    pub seq:        Tally,
    /// Milliseconds since the Unix epoch at allocation time.
    pub timestamp:  Tally,
    pub stack:      Stack,
}

/// The identity under which an open resource is tracked. The `open`
/// family hands out descriptors, the `fopen` family stream handles;
/// the two never alias even if a stream wraps a tracked descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FdKey {
    Fd(c_int),
    Stream(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdRecord {
    pub key:        FdKey,
    /// The descriptor number. For streams, the one backing the stream
    /// at open time (-1 if it could not be determined).
    pub fd:         c_int,
    pub path:       String,
    pub flags:      c_int,
    pub seq:        Tally,
    pub timestamp:  Tally,
    pub stack:      Stack,
}

impl FdRecord {
    pub fn stream(&self) -> Option<usize> {
        match self.key {
            FdKey::Stream(h)    => Some(h),
            FdKey::Fd(_)        => None,
        }
    }
}

/// Placeholder path for opens whose path argument was null or not UTF-8
/// decodable at all.
pub const UNKNOWN_PATH: &str = "<unknown>";

/// Maps an `fopen` mode string to the `open(2)` flags it implies.
pub fn mode_to_flags(mode: &str) -> c_int {
    let plus = mode.contains('+');
    if mode.starts_with('r') {
        if plus { libc::O_RDWR } else { libc::O_RDONLY }
    } else if mode.starts_with('w') || mode.starts_with('a') {
        if plus { libc::O_RDWR } else { libc::O_WRONLY }
    } else {
        0
    }
}
