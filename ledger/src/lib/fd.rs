use crate::utils::*;
use crate::record::{FdKey, FdRecord};
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::os::raw::c_int;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FdStats {
    pub total_open_count:   Tally,
    pub total_close_count:  Tally,
    pub current_open_count: Tally,
}

impl fmt::Display for FdStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FdStats{{totalOpenCount={}, totalCloseCount={}, currentOpenCount={}}}",
            self.total_open_count,
            self.total_close_count,
            self.current_open_count
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct FdSnapshot {
    pub stats:      FdStats,
    pub records:    Vec<FdRecord>,
}

#[derive(Debug, Default)]
struct Book {
    live:   FastMap<FdKey, FdRecord>,
    opened: Tally,
    closed: Tally,
    seq:    Tally,
}

/// Open descriptors and streams. Far colder than the heap path, so one
/// lock over the whole book is enough.
#[derive(Debug)]
pub struct FdLedger {
    book:   Mutex<Book>,
    strict: AtomicBool,
}

impl FdLedger {
    pub fn new(policy: FreePolicy) -> Self {
        Self {
            book:   Mutex::new(Book::default()),
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

    /// Books a successful open. `fd` is the descriptor (for streams,
    /// the one underneath); negative descriptors on the `Fd` key mean
    /// the open failed and are ignored, as are null stream handles.
    pub fn record_open(&self, key: FdKey, fd: c_int, path: &str, flags: c_int, stack: Stack) {
        match key {
            FdKey::Fd(n) if n < 0   => return,
            FdKey::Stream(0)        => return,
            _                       => {},
        }
        let mut book = lock(&self.book);
        let seq = book.seq;
        book.seq += 1;
        book.opened += 1;
        let rec = FdRecord {
            key,
            fd,
            path: path.to_string(),
            flags,
            seq,
            timestamp: now_millis(),
            stack,
        };
        if let Some(stale) = book.live.insert(key, rec) {
            // Descriptor numbers are reused as soon as they're closed;
            // a close we didn't see must have come first.
            log::debug!("{:?} reopened without a tracked close (was {})", key, stale.path);
            book.closed += 1;
        }
    }

    /// Books a close. Returns the removed record if `key` was tracked.
    pub fn record_close(&self, key: FdKey) -> Option<FdRecord> {
        let counted = self.policy().counts_untracked();
        let mut book = lock(&self.book);
        match book.live.swap_remove(&key) {
            Some(rec)   => {
                book.closed += 1;
                Some(rec)
            },
            None        => {
                if counted {
                    book.closed += 1;
                }
                drop(book);
                log::debug!("close of untracked {:?} (counted: {})", key, counted);
                None
            }
        }
    }

    pub fn get(&self, key: FdKey) -> Option<FdRecord> {
        lock(&self.book).live.get(&key).cloned()
    }

    fn stats_of(book: &Book) -> FdStats {
        FdStats {
            total_open_count:   book.opened,
            total_close_count:  book.closed,
            current_open_count: book.live.len() as Tally,
        }
    }

    pub fn stats(&self) -> FdStats {
        Self::stats_of(&lock(&self.book))
    }

    pub fn snapshot(&self) -> FdSnapshot {
        let book = lock(&self.book);
        let stats = Self::stats_of(&book);
        let mut records: Vec<FdRecord> = book.live.values().cloned().collect();
        drop(book);
        records.sort_unstable_by_key(|r| r.seq);
        FdSnapshot { stats, records }
    }

    pub fn reset(&self) {
        let mut book = lock(&self.book);
        book.live.clear();
        book.opened = 0;
        book.closed = 0;
    }

    pub fn len(&self) -> usize {
        lock(&self.book).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdLedger {
    fn default() -> Self {
        Self::new(FreePolicy::default())
    }
}
