use crate::utils::*;
use crate::record::AllocationRecord;
use crate::stack::Stack;
use serde::{Deserialize, Serialize};

/// Number of independently locked partitions of the ledger. A power
/// of two, so that the shard index is a mask away from the hash.
pub const SHARDS: usize = 64;

/// A consistent view of the memory counters.
///
/// `total_*` only ever grow (until a reset). `current_*` are the live
/// ledger's entry count and byte sum at the same instant; they are never
/// stored separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_alloc_count:      Tally,
    pub total_alloc_size:       Tally,
    pub total_free_count:       Tally,
    pub total_free_size:        Tally,
    pub current_alloc_count:    Tally,
    pub current_alloc_size:     Tally,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryStats{{totalAllocCount={}, totalAllocSize={}, totalFreeCount={}, \
             totalFreeSize={}, currentAllocCount={}, currentAllocSize={}}}",
            self.total_alloc_count,
            self.total_alloc_size,
            self.total_free_count,
            self.total_free_size,
            self.current_alloc_count,
            self.current_alloc_size
        )
    }
}

/// Stats plus every live record, taken under one lock sweep. Records
/// are in allocation order.
#[derive(Clone, Debug, Default)]
pub struct MemorySnapshot {
    pub stats:      MemoryStats,
    pub records:    Vec<AllocationRecord>,
}

/// How records spread over the shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStats {
    pub total_records:  usize,
    pub max_shard_len:  usize,
    pub avg_shard_len:  f64,
}

/// What a `realloc` did to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReallocOutcome {
    /// `realloc(NULL, n)`: a plain allocation.
    Allocated,
    /// `realloc(p, 0)`: a plain free.
    Freed,
    /// Same pointer handed back; only the size changed.
    Resized,
    /// Block moved: old record gone, new one in.
    Moved,
    /// The underlying call failed; the old block (if any) is untouched.
    Failed,
}

#[derive(Clone, Copy, Debug, Default)]
struct Totals {
    alloc_count:    Tally,
    alloc_size:     Tally,
    free_count:     Tally,
    free_size:      Tally,
}

#[derive(Debug, Default)]
struct Shard {
    live:       FastMap<usize, AllocationRecord>,
    live_size:  Tally,
    totals:     Totals,
}

impl Shard {
    fn admit(&mut self, rec: AllocationRecord) {
        self.totals.alloc_count += 1;
        self.totals.alloc_size += rec.size;
        self.live_size += rec.size;
        if let Some(stale) = self.live.insert(rec.ptr, rec) {
            // The allocator handed out a block we still believed live:
            // its free happened somewhere we don't intercept.
            self.totals.free_count += 1;
            self.totals.free_size += stale.size;
            self.live_size -= stale.size;
        }
    }

    fn release(&mut self, ptr: usize, count_untracked: bool) -> Option<AllocationRecord> {
        match self.live.swap_remove(&ptr) {
            Some(rec)   => {
                self.totals.free_count += 1;
                self.totals.free_size += rec.size;
                self.live_size -= rec.size;
                Some(rec)
            },
            None        => {
                if count_untracked {
                    self.totals.free_count += 1;
                }
                None
            }
        }
    }

    fn holds(&self, ptr: usize, seq: u64) -> bool {
        self.live.get(&ptr).is_some_and(|r| r.seq == seq)
    }

    /// Releases the block a `realloc` gave back. `seen` is the sequence
    /// number `ptr` carried before the real call; a record with any
    /// other number was booked since by whoever got the address next,
    /// and its admission already retired ours.
    fn release_seen(&mut self, ptr: usize, seen: Option<u64>, count_untracked: bool) {
        match seen {
            Some(seq) if self.holds(ptr, seq) => {
                self.release(ptr, false);
            },
            Some(seq)   => log::debug!("realloc source {:#x} (seq {}) already reused", ptr, seq),
            None        => {
                if count_untracked {
                    self.totals.free_count += 1;
                }
            }
        }
    }

    fn resize(&mut self, ptr: usize, size: Tally, stack: Stack) -> bool {
        match self.live.get_mut(&ptr) {
            Some(rec)   => {
                if size >= rec.size {
                    self.totals.alloc_size += size - rec.size;
                    self.live_size += size - rec.size;
                } else {
                    self.totals.free_size += rec.size - size;
                    self.live_size -= rec.size - size;
                }
                rec.size = size;
                if !stack.is_empty() {
                    rec.stack = stack;
                }
                true
            },
            None        => false,
        }
    }

    fn clear(&mut self) {
        self.live.clear();
        self.live_size = 0;
        self.totals = Totals::default();
    }
}

/// The authoritative set of live heap blocks, with the counters derived
/// from its mutations.
///
/// Each shard is a mutex over its part of the map *and* its counters,
/// so a mutation and its accounting are one atomic step. Whole-ledger
/// operations (stats, snapshots, reset) lock every shard in ascending
/// index order; a `realloc` spanning two shards locks both in that same
/// order. No reader can observe a half-applied mutation.
#[derive(Debug)]
pub struct AllocLedger {
    shards: Box<[Mutex<Shard>]>,
    seq:    AtomicU64,
    strict: AtomicBool,
}

#[inline(always)]
fn shard_of(ptr: usize) -> usize {
    // Heap blocks are at least 16-byte aligned; the low bits carry
    // nothing.
    let h = (ptr >> 4) ^ (ptr >> 12) ^ (ptr >> 20);
    h & (SHARDS - 1)
}

impl AllocLedger {
    pub fn new(policy: FreePolicy) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(Shard::default())).collect(),
            seq:    AtomicU64::new(0),
            strict: AtomicBool::new(!policy.counts_untracked()),
        }
    }

    pub fn policy(&self) -> FreePolicy {
        if self.strict.load(Ordering::Relaxed) {
            FreePolicy::Strict
        } else {
            FreePolicy::Permissive
        }
    }

    pub fn set_policy(&self, policy: FreePolicy) {
        self.strict.store(!policy.counts_untracked(), Ordering::Relaxed);
    }

    fn make_record(&self, ptr: usize, size: Tally, stack: Stack) -> AllocationRecord {
        AllocationRecord {
            ptr,
            size,
            seq:        self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp:  now_millis(),
            stack,
        }
    }

    /// Books a successful allocation. Null results are not allocations.
    pub fn record_alloc(&self, ptr: usize, size: Tally, stack: Stack) {
        if ptr == 0 {
            return;
        }
        let rec = self.make_record(ptr, size, stack);
        lock(&self.shards[shard_of(ptr)]).admit(rec);
    }

    /// Books a release. Returns the freed record's size if `ptr` was
    /// tracked. Untracked pointers are handled per [`FreePolicy`].
    pub fn record_free(&self, ptr: usize) -> Option<Tally> {
        if ptr == 0 {
            return None;
        }
        let counted = self.policy().counts_untracked();
        let res = lock(&self.shards[shard_of(ptr)])
            .release(ptr, counted)
            .map(|rec| rec.size);
        if res.is_none() {
            log::debug!("free of untracked pointer {:#x} (counted: {})", ptr, counted);
        }
        res
    }

    /// Sequence number of the live record at `ptr`, if any. Read it
    /// before handing a block to the real `realloc` and pass it to
    /// [`AllocLedger::record_realloc`].
    pub fn seq_of(&self, ptr: usize) -> Option<u64> {
        if ptr == 0 {
            return None;
        }
        lock(&self.shards[shard_of(ptr)]).live.get(&ptr).map(|r| r.seq)
    }

    /// Books the outcome of `realloc(old, size)` which returned `new`.
    /// `seen` is what [`AllocLedger::seq_of`] said about `old` before
    /// the call: once `realloc` returns, `old` may already belong to
    /// another thread's allocation, and only the record we saw is ours
    /// to remove.
    pub fn record_realloc(&self, old: usize, seen: Option<u64>, new: usize, size: Tally, stack: Stack) -> ReallocOutcome {
        if old == 0 {
            if new == 0 {
                return ReallocOutcome::Failed;
            }
            self.record_alloc(new, size, stack);
            return ReallocOutcome::Allocated;
        }
        let counted = self.policy().counts_untracked();
        if size == 0 {
            lock(&self.shards[shard_of(old)]).release_seen(old, seen, counted);
            return ReallocOutcome::Freed;
        }
        if new == 0 {
            return ReallocOutcome::Failed;
        }

        let (i_old, i_new) = (shard_of(old), shard_of(new));
        if i_old == i_new {
            let mut shard = lock(&self.shards[i_old]);
            // An unfreed block cannot have been reused: same address
            // means same record.
            if old == new && seen.is_some_and(|seq| shard.holds(old, seq)) {
                shard.resize(old, size, stack);
                return ReallocOutcome::Resized;
            }
            shard.release_seen(old, seen, counted);
            shard.admit(self.make_record(new, size, stack));
        } else {
            let (lo, hi) = (i_old.min(i_new), i_old.max(i_new));
            let mut g_lo = lock(&self.shards[lo]);
            let mut g_hi = lock(&self.shards[hi]);
            let (from, to) = if i_old == lo {
                (&mut *g_lo, &mut *g_hi)
            } else {
                (&mut *g_hi, &mut *g_lo)
            };
            from.release_seen(old, seen, counted);
            to.admit(self.make_record(new, size, stack));
        }
        ReallocOutcome::Moved
    }

    /// Looks up one live record.
    pub fn get(&self, ptr: usize) -> Option<AllocationRecord> {
        lock(&self.shards[shard_of(ptr)]).live.get(&ptr).cloned()
    }

    fn lock_all(&self) -> Vec<MutexGuard<'_, Shard>> {
        self.shards.iter().map(lock).collect()
    }

    fn stats_of(guards: &[MutexGuard<'_, Shard>]) -> MemoryStats {
        guards.iter().fold(MemoryStats::default(), |mut s, g| {
            s.total_alloc_count += g.totals.alloc_count;
            s.total_alloc_size += g.totals.alloc_size;
            s.total_free_count += g.totals.free_count;
            s.total_free_size += g.totals.free_size;
            s.current_alloc_count += g.live.len() as Tally;
            s.current_alloc_size += g.live_size;
            s
        })
    }

    pub fn stats(&self) -> MemoryStats {
        Self::stats_of(&self.lock_all())
    }

    /// Stats and records from the same instant. Locks are held only
    /// while copying.
    pub fn snapshot(&self) -> MemorySnapshot {
        let guards = self.lock_all();
        let stats = Self::stats_of(&guards);
        let mut records: Vec<AllocationRecord> = guards
            .iter()
            .flat_map(|g| g.live.values().cloned())
            .collect();
        drop(guards);
        records.sort_unstable_by_key(|r| r.seq);
        MemorySnapshot { stats, records }
    }

    /// Drops every live record and zeroes every counter, as one step.
    pub fn reset(&self) {
        let mut guards = self.lock_all();
        for g in guards.iter_mut() {
            g.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lock_all().iter().map(|g| g.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_stats(&self) -> ShardStats {
        let lens: Vec<usize> = self.lock_all().iter().map(|g| g.live.len()).collect();
        let total_records: usize = lens.iter().sum();
        ShardStats {
            total_records,
            max_shard_len: lens.iter().copied().max().unwrap_or(0),
            avg_shard_len: total_records as f64 / SHARDS as f64,
        }
    }
}

impl Default for AllocLedger {
    fn default() -> Self {
        Self::new(FreePolicy::default())
    }
}
