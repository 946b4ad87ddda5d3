//! The functions hooked modules end up calling instead of the real
//! ones.
//!
//! Every proxy follows the same shape: perform the real call through
//! the remembered original, then (outermost call only, bookkeeping not
//! already running on this thread) tell the engine what happened, and
//! return the real result untouched. Releases are booked *before* the
//! real call, since the moment `free`/`close` returns the identity may
//! be handed out again on another thread. `realloc` cannot split its
//! release from its result, so it notes the old block's record first
//! and only that record is removed afterwards.
use crate::api;
use crate::engine::Engine;
use crate::ffi::*;
use crate::original;
use crate::symbols::Symbol;
use ledger::{mode_to_flags, FdKey, Tally};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::LocalKey;

thread_local! {
    // Set while this thread runs engine code; nested wrapper calls
    // from in there pass straight through.
    static BUSY: Cell<bool> = const { Cell::new(false) };
    // Nesting of intercepted calls, e.g. `operator new` -> `malloc`
    // when both sit in hooked modules.
    static MEM_DEPTH: Cell<u32> = const { Cell::new(0) };
    static FD_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct Depth {
    key:        &'static LocalKey<Cell<u32>>,
    outermost:  bool,
}

impl Depth {
    #[inline(always)]
    fn enter(key: &'static LocalKey<Cell<u32>>) -> Self {
        let outermost = key
            .try_with(|d| {
                let prev = d.get();
                d.set(prev + 1);
                prev == 0
            })
            .unwrap_or(false);
        Depth { key, outermost }
    }
}

impl Drop for Depth {
    #[inline(always)]
    fn drop(&mut self) {
        let _ = self.key.try_with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Marks the calling thread as running engine code until dropped.
/// Intercepted calls made meanwhile (the ledgers allocate too) pass
/// through unbooked.
pub struct Quiet {
    was_busy: bool,
}

impl Quiet {
    #[inline(always)]
    pub fn enter() -> Self {
        Quiet { was_busy: BUSY.try_with(|b| b.replace(true)).unwrap_or(true) }
    }
}

impl Drop for Quiet {
    #[inline(always)]
    fn drop(&mut self) {
        if !self.was_busy {
            let _ = BUSY.try_with(|b| b.set(false));
        }
    }
}

/// Runs `f` against the live engine, unless bookkeeping is already in
/// progress on this thread or there is no initialized engine. Panics
/// are swallowed: the intercepted call must complete regardless.
#[inline(always)]
fn book<R, F: FnOnce(&Engine) -> R>(depth: &Depth, f: F) -> Option<R> {
    if !depth.outermost {
        return None;
    }
    let engine = api::running()?;
    let quiet = Quiet::enter();
    if quiet.was_busy {
        return None;
    }
    match catch_unwind(AssertUnwindSafe(|| f(engine))) {
        Ok(r)   => Some(r),
        Err(_)  => {
            engine.note_panic();
            None
        }
    }
}

/// Whether the calling thread is inside engine code.
pub fn in_bookkeeping() -> bool {
    BUSY.try_with(Cell::get).unwrap_or(true)
}

pub unsafe extern "C" fn malloc_proxy(size: size_t) -> *mut void {
    let depth = Depth::enter(&MEM_DEPTH);
    let p = match original::malloc() {
        Some(real)  => real(size),
        None        => std::ptr::null_mut(),
    };
    book(&depth, |e| e.on_alloc(p as usize, size as Tally, malloc_proxy as usize));
    p
}

pub unsafe extern "C" fn calloc_proxy(nobj: size_t, size: size_t) -> *mut void {
    let depth = Depth::enter(&MEM_DEPTH);
    let p = match original::calloc() {
        Some(real)  => real(nobj, size),
        None        => std::ptr::null_mut(),
    };
    // A non-null result means the product did not overflow.
    book(&depth, |e| e.on_alloc(p as usize, nobj.wrapping_mul(size) as Tally, calloc_proxy as usize));
    p
}

pub unsafe extern "C" fn realloc_proxy(old: *mut void, size: size_t) -> *mut void {
    let depth = Depth::enter(&MEM_DEPTH);
    // The moment the real call returns, `old` may be someone else's.
    let seen = book(&depth, |e| e.before_realloc(old as usize)).flatten();
    let p = match original::realloc() {
        Some(real)  => real(old, size),
        None        => std::ptr::null_mut(),
    };
    book(&depth, |e| e.on_realloc(old as usize, seen, p as usize, size as Tally, realloc_proxy as usize));
    p
}

pub unsafe extern "C" fn free_proxy(p: *mut void) {
    let depth = Depth::enter(&MEM_DEPTH);
    book(&depth, |e| e.on_free(p as usize));
    if let Some(real) = original::free() {
        real(p);
    }
}

// The `new` proxies may unwind (`std::bad_alloc`); nothing is booked
// then, and the depth guard still unwinds.
pub unsafe extern "C-unwind" fn new_proxy(size: size_t) -> *mut void {
    let depth = Depth::enter(&MEM_DEPTH);
    let p = match original::new() {
        Some(real)  => real(size),
        None        => std::ptr::null_mut(),
    };
    book(&depth, |e| e.on_alloc(p as usize, size as Tally, new_proxy as usize));
    p
}

pub unsafe extern "C-unwind" fn new_array_proxy(size: size_t) -> *mut void {
    let depth = Depth::enter(&MEM_DEPTH);
    let p = match original::new_array() {
        Some(real)  => real(size),
        None        => std::ptr::null_mut(),
    };
    book(&depth, |e| e.on_alloc(p as usize, size as Tally, new_array_proxy as usize));
    p
}

pub unsafe extern "C" fn delete_proxy(p: *mut void) {
    let depth = Depth::enter(&MEM_DEPTH);
    book(&depth, |e| e.on_free(p as usize));
    if let Some(real) = original::delete() {
        real(p);
    }
}

pub unsafe extern "C" fn delete_array_proxy(p: *mut void) {
    let depth = Depth::enter(&MEM_DEPTH);
    book(&depth, |e| e.on_free(p as usize));
    if let Some(real) = original::delete_array() {
        real(p);
    }
}

#[inline(always)]
unsafe fn book_open(depth: &Depth, fd: int, path: *const char, flags: int, anchor: usize) {
    if fd < 0 {
        return;
    }
    book(depth, |e| e.on_open(FdKey::Fd(fd), fd, lossy_str(path), flags, anchor));
}

pub unsafe extern "C" fn open_proxy(path: *const char, flags: int, mode: mode_t) -> int {
    let depth = Depth::enter(&FD_DEPTH);
    let fd = match original::open() {
        Some(real)  => real(path, flags, mode),
        None        => -1,
    };
    book_open(&depth, fd, path, flags, open_proxy as usize);
    fd
}

pub unsafe extern "C" fn open64_proxy(path: *const char, flags: int, mode: mode_t) -> int {
    let depth = Depth::enter(&FD_DEPTH);
    let fd = match original::open64() {
        Some(real)  => real(path, flags, mode),
        None        => -1,
    };
    book_open(&depth, fd, path, flags, open64_proxy as usize);
    fd
}

pub unsafe extern "C" fn open_2_proxy(path: *const char, flags: int) -> int {
    let depth = Depth::enter(&FD_DEPTH);
    let fd = match original::open_2() {
        Some(real)  => real(path, flags),
        None        => -1,
    };
    book_open(&depth, fd, path, flags, open_2_proxy as usize);
    fd
}

pub unsafe extern "C" fn close_proxy(fd: int) -> int {
    let depth = Depth::enter(&FD_DEPTH);
    book(&depth, |e| e.on_close(FdKey::Fd(fd)));
    match original::close() {
        Some(real)  => real(fd),
        None        => -1,
    }
}

#[inline(always)]
unsafe fn book_fopen(depth: &Depth, stream: *mut FILE, path: *const char, mode: *const char, anchor: usize) {
    if stream.is_null() {
        return;
    }
    book(depth, |e| {
        let flags = lossy_str(mode).map_or(0, |m| mode_to_flags(&m));
        e.on_open(FdKey::Stream(stream as usize), fileno(stream), lossy_str(path), flags, anchor)
    });
}

pub unsafe extern "C" fn fopen_proxy(path: *const char, mode: *const char) -> *mut FILE {
    let depth = Depth::enter(&FD_DEPTH);
    let stream = match original::fopen() {
        Some(real)  => real(path, mode),
        None        => std::ptr::null_mut(),
    };
    book_fopen(&depth, stream, path, mode, fopen_proxy as usize);
    stream
}

pub unsafe extern "C" fn fopen64_proxy(path: *const char, mode: *const char) -> *mut FILE {
    let depth = Depth::enter(&FD_DEPTH);
    let stream = match original::fopen64() {
        Some(real)  => real(path, mode),
        None        => std::ptr::null_mut(),
    };
    book_fopen(&depth, stream, path, mode, fopen64_proxy as usize);
    stream
}

pub unsafe extern "C" fn fclose_proxy(stream: *mut FILE) -> int {
    let depth = Depth::enter(&FD_DEPTH);
    if !stream.is_null() {
        book(&depth, |e| e.on_close(FdKey::Stream(stream as usize)));
    }
    match original::fclose() {
        Some(real)  => real(stream),
        None        => libc::EOF,
    }
}

/// Entry address of the proxy standing in for `sym`.
pub fn wrapper_for(sym: Symbol) -> usize {
    match sym {
        Symbol::Malloc      => malloc_proxy as usize,
        Symbol::Calloc      => calloc_proxy as usize,
        Symbol::Realloc     => realloc_proxy as usize,
        Symbol::Free        => free_proxy as usize,
        Symbol::New         => new_proxy as usize,
        Symbol::NewArray    => new_array_proxy as usize,
        Symbol::Delete      => delete_proxy as usize,
        Symbol::DeleteArray => delete_array_proxy as usize,
        Symbol::Open        => open_proxy as usize,
        Symbol::Open64      => open64_proxy as usize,
        Symbol::Open2       => open_2_proxy as usize,
        Symbol::Close       => close_proxy as usize,
        Symbol::Fopen       => fopen_proxy as usize,
        Symbol::Fopen64     => fopen64_proxy as usize,
        Symbol::Fclose      => fclose_proxy as usize,
    }
}
