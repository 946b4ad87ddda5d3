use crate::utils::*;
use std::ffi::{c_void, CStr};
use std::sync::Arc;

/// Frames kept per record unless configured otherwise.
pub const DEFAULT_MAX_FRAMES: usize = 16;
/// Hard ceiling for [`Capturer::set_max_frames`].
pub const MAX_FRAMES_LIMIT: usize = 64;
// How deep to look for the anchor frame before giving up on it.
const ANCHOR_WINDOW: usize = 24;
// Symbolized addresses kept around between queries.
const SYMBOL_CACHE_CAPACITY: usize = 4096;

/// Return addresses of one call stack, innermost first. An empty
/// stack means "not captured".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Stack(Box<[usize]>);

impl Stack {
    pub fn from_frames(frames: Vec<usize>) -> Self {
        Self(frames.into_boxed_slice())
    }

    pub fn frames(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The process-wide "capture stacks or not" switch, plus the depth
/// limit. Reading the switch is a single atomic load, so toggling it
/// never has to pause the ledgers.
///
/// > Capturing costs roughly 10-20x the plain bookkeeping path. It is
/// > never turned on implicitly.
#[derive(Debug)]
pub struct Capturer {
    enabled:    AtomicBool,
    max_frames: AtomicUsize,
}

impl Capturer {
    pub fn new(enabled: bool, max_frames: usize) -> Self {
        Self {
            enabled:    AtomicBool::new(enabled),
            max_frames: AtomicUsize::new(max_frames.clamp(1, MAX_FRAMES_LIMIT)),
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_enabled(&self, on: bool) -> bool {
        self.enabled.swap(on, Ordering::AcqRel)
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames.load(Ordering::Relaxed)
    }

    pub fn set_max_frames(&self, n: usize) {
        self.max_frames.store(n.clamp(1, MAX_FRAMES_LIMIT), Ordering::Relaxed);
    }

    /// Captures the calling thread's stack if capturing is on.
    ///
    /// `anchor` is the entry address of the outermost function that
    /// should *not* appear, typically the intercepting wrapper: frames
    /// up to and including it are dropped. With `anchor == 0` the stack
    /// starts at the caller of this function.
    #[inline(always)]
    pub fn capture(&self, anchor: usize) -> Stack {
        if !self.is_enabled() {
            return Stack::default();
        }
        walk(self.max_frames(), anchor)
    }
}

impl Default for Capturer {
    fn default() -> Self {
        Self::new(false, DEFAULT_MAX_FRAMES)
    }
}

/// Walks the current thread's stack, keeping at most `max_frames`
/// return addresses above the anchor (see [`Capturer::capture`]).
/// Unwinding failures simply yield a shorter, possibly empty, stack.
#[inline(never)]
pub fn walk(max_frames: usize, anchor: usize) -> Stack {
    let me = walk as usize;
    let mut ips: Vec<usize> = Vec::with_capacity(max_frames + ANCHOR_WINDOW);
    let mut start: Option<usize> = None;

    backtrace::trace(|frame| {
        let ip = frame.ip() as usize;
        if ip == 0 {
            return true;
        }
        if ips.len() < ANCHOR_WINDOW {
            let entry = frame.symbol_address() as usize;
            // The anchor sits above `walk`, so it wins when both match.
            if entry == me || (anchor != 0 && entry == anchor) {
                start = Some(ips.len() + 1);
            }
        }
        ips.push(ip);
        ips.len() < start.unwrap_or(ANCHOR_WINDOW) + max_frames
    });

    // Without a recognizable frame for `walk`, assume it is the first.
    let from = start.unwrap_or(1).min(ips.len());
    Stack::from_frames(ips.drain(from..).take(max_frames).collect())
}

/// One symbolized return address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub addr:   usize,
    pub symbol: Option<String>,
    pub offset: usize,
    pub module: Option<String>,
}

impl Frame {
    fn raw(addr: usize) -> Self {
        Self { addr, symbol: None, offset: 0, module: None }
    }

    /// `name+0xoff`, or the bare address when unresolved.
    pub fn short(&self) -> String {
        match &self.symbol {
            Some(s) => format!("{}+{:#x}", s, self.offset),
            None    => format!("{:#x}", self.addr),
        }
    }

    /// `0xaddr name+0xoff (module)`.
    pub fn long(&self) -> String {
        let module = self.module.as_deref().unwrap_or("?");
        match &self.symbol {
            Some(s) => format!("{:#x} {}+{:#x} ({})", self.addr, s, self.offset, module),
            None    => format!("{:#x} ({})", self.addr, module),
        }
    }
}

/// Resolves return addresses to symbols through `dladdr`, caching the
/// results. Resolution happens at query time only; the hot path stores
/// raw addresses.
#[derive(Debug, Default)]
pub struct Symbolizer {
    cache: Mutex<FastMap<usize, Arc<Frame>>>,
}

impl Symbolizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, addr: usize) -> Arc<Frame> {
        if let Some(f) = lock(&self.cache).get(&addr) {
            return f.clone();
        }
        // `dladdr` may take the loader lock; don't hold ours meanwhile.
        let frame = Arc::new(dladdr_frame(addr));
        let mut cache = lock(&self.cache);
        if cache.len() < SYMBOL_CACHE_CAPACITY {
            cache.entry(addr).or_insert_with(|| frame.clone());
        }
        frame
    }

    pub fn render_short(&self, stack: &Stack) -> Vec<String> {
        stack.frames().iter().map(|a| self.resolve(*a).short()).collect()
    }

    pub fn render_long(&self, stack: &Stack) -> Vec<String> {
        stack.frames().iter().map(|a| self.resolve(*a).long()).collect()
    }

    pub fn cached(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn clear(&self) {
        lock(&self.cache).clear();
    }
}

fn dladdr_frame(addr: usize) -> Frame {
    // SAFETY: `dladdr` only reads loader metadata; a zeroed `Dl_info`
    // is a valid out-parameter and the strings it fills in point into
    // loaded objects' string tables.
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(addr as *const c_void, &mut info) == 0 {
            return Frame::raw(addr);
        }
        let module = if info.dli_fname.is_null() {
            None
        } else {
            let full = CStr::from_ptr(info.dli_fname).to_string_lossy();
            Some(full.rsplit('/').next().unwrap_or(&full).to_string())
        };
        if info.dli_sname.is_null() || info.dli_saddr.is_null() {
            return Frame { module, ..Frame::raw(addr) };
        }
        let name = backtrace::SymbolName::new(CStr::from_ptr(info.dli_sname).to_bytes());
        Frame {
            addr,
            symbol: Some(name.to_string()),
            offset: addr.wrapping_sub(info.dli_saddr as usize),
            module,
        }
    }
}
