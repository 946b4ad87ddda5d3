//! The three JSON shapes served to dashboards. Field names are part of
//! the wire contract; keep them stable.
use crate::utils::*;
use crate::alloc::MemorySnapshot;
use crate::fd::FdSnapshot;
use crate::record::AllocationRecord;
use crate::stack::{Stack, Symbolizer};
use serde::{Deserialize, Serialize};
use std::os::raw::c_int;

/// One live allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakEntry {
    /// Hex, `0x`-prefixed.
    pub ptr:        String,
    pub size:       Tally,
    pub timestamp:  Tally,
    pub backtrace:  Vec<String>,
}

/// Live allocations sharing one call stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakGroup {
    pub backtrace:  Vec<String>,
    pub count:      Tally,
    pub total_size: Tally,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdLeakEntry {
    pub fd:         c_int,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream:     Option<String>,
    pub path:       String,
    pub flags:      c_int,
    pub timestamp:  Tally,
    pub backtrace:  Vec<String>,
}

pub fn leaks(snap: &MemorySnapshot, sym: &Symbolizer) -> Vec<LeakEntry> {
    snap.records
        .iter()
        .map(|r| LeakEntry {
            ptr:        format!("{:#x}", r.ptr),
            size:       r.size,
            timestamp:  r.timestamp,
            backtrace:  sym.render_short(&r.stack),
        })
        .collect()
}

/// Groups live records by identical call stack, compared by raw return
/// addresses, and renders each group's stack once through `render`.
/// Groups come out by total size, largest first; equal totals keep
/// first-seen order.
pub fn group_by_stack<F>(records: &[AllocationRecord], render: F) -> Vec<LeakGroup>
where
    F: Fn(&Stack) -> Vec<String>,
{
    let mut groups: FastMap<&Stack, (Tally, Tally)> = FastMap::default();
    for r in records {
        let g = groups.entry(&r.stack).or_insert((0, 0));
        g.0 += 1;
        g.1 += r.size;
    }
    groups
        .into_iter()
        .map(|(stack, (count, total_size))| LeakGroup {
            backtrace: render(stack),
            count,
            total_size,
        })
        .sorted_by(|a, b| b.total_size.cmp(&a.total_size))
        .collect()
}

pub fn aggregate(snap: &MemorySnapshot, sym: &Symbolizer) -> Vec<LeakGroup> {
    group_by_stack(&snap.records, |s| sym.render_short(s))
}

pub fn fd_leaks(snap: &FdSnapshot, sym: &Symbolizer) -> Vec<FdLeakEntry> {
    snap.records
        .iter()
        .map(|r| FdLeakEntry {
            fd:         r.fd,
            stream:     r.stream().map(|h| format!("{:#x}", h)),
            path:       r.path.clone(),
            flags:      r.flags,
            timestamp:  r.timestamp,
            backtrace:  sym.render_short(&r.stack),
        })
        .collect()
}

/// Serializes to a JSON array. These shapes hold only strings and
/// integers, so this cannot fail in practice; should it, the result is
/// still a valid (empty) array.
pub fn to_array<T: Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|e| {
        log::warn!("JSON serialization failed: {}", e);
        String::from("[]")
    })
}

pub fn leaks_json(snap: &MemorySnapshot, sym: &Symbolizer) -> String {
    to_array(&leaks(snap, sym))
}

pub fn aggregated_json(snap: &MemorySnapshot, sym: &Symbolizer) -> String {
    to_array(&aggregate(snap, sym))
}

pub fn fd_leaks_json(snap: &FdSnapshot, sym: &Symbolizer) -> String {
    to_array(&fd_leaks(snap, sym))
}
