//! The process-wide engine and the operations exposed on it, once as
//! Rust functions and once as a C ABI (`soleak_*`).
use crate::engine::{Engine, Status};
use crate::symbols::Symbol;
use ledger::{FdStats, MemoryStats, ShardStats};
use once_cell::sync::OnceCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;

static ENGINE: OnceCell<Engine> = OnceCell::new();

/// The process-wide engine, created (uninitialized, patching GOTs) on
/// first use.
pub fn engine() -> &'static Engine {
    ENGINE.get_or_init(Engine::with_plt)
}

/// The process-wide engine if it exists and is initialized. Never
/// creates it: wrappers must not allocate a whole engine from inside
/// `malloc`.
#[inline(always)]
pub(crate) fn running() -> Option<&'static Engine> {
    ENGINE.get().filter(|e| e.is_initialized())
}

pub fn init(debug: bool, backtrace: bool) -> c_int {
    engine().init(debug, backtrace).code()
}

pub fn hook<S: AsRef<str>>(modules: &[S]) -> c_int {
    engine().hook(modules).code()
}

pub fn unhook<S: AsRef<str>>(modules: &[S]) -> c_int {
    engine().unhook(modules).code()
}

pub fn unhook_all() -> c_int {
    engine().unhook_all().code()
}

pub fn get_memory_stats() -> MemoryStats {
    engine().memory_stats()
}

pub fn get_fd_stats() -> FdStats {
    engine().fd_stats()
}

pub fn reset_stats() {
    engine().reset_stats()
}

pub fn reset_fd_stats() {
    engine().reset_fd_stats()
}

pub fn set_backtrace_enabled(on: bool) {
    engine().set_backtrace_enabled(on)
}

pub fn is_backtrace_enabled() -> bool {
    engine().is_backtrace_enabled()
}

pub fn get_leak_report() -> String {
    engine().leak_report()
}

pub fn get_fd_leak_report() -> String {
    engine().fd_leak_report()
}

pub fn dump_leak_report<P: AsRef<Path>>(path: Option<P>) -> c_int {
    engine().dump_leak_report(path.as_ref().map(|p| p.as_ref())).code()
}

pub fn dump_fd_leak_report<P: AsRef<Path>>(path: Option<P>) -> c_int {
    engine().dump_fd_leak_report(path.as_ref().map(|p| p.as_ref())).code()
}

pub fn get_leaks_json() -> String {
    engine().leaks_json()
}

pub fn get_fd_leaks_json() -> String {
    engine().fd_leaks_json()
}

pub fn get_leaks_aggregated_json() -> String {
    engine().leaks_aggregated_json()
}

pub fn get_hooked_modules() -> Vec<String> {
    engine().hooked_modules()
}

pub fn get_ledger_shard_stats() -> ShardStats {
    engine().shard_stats()
}

pub fn is_hooked(module: &str, symbol: Symbol) -> bool {
    engine().is_hooked(module, symbol)
}

pub fn shutdown() {
    engine().shutdown()
}

/* C ABI */

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoleakMemoryStats {
    pub total_alloc_count:      u64,
    pub total_alloc_size:       u64,
    pub total_free_count:       u64,
    pub total_free_size:        u64,
    pub current_alloc_count:    u64,
    pub current_alloc_size:     u64,
}

impl From<MemoryStats> for SoleakMemoryStats {
    fn from(s: MemoryStats) -> Self {
        Self {
            total_alloc_count:      s.total_alloc_count,
            total_alloc_size:       s.total_alloc_size,
            total_free_count:       s.total_free_count,
            total_free_size:        s.total_free_size,
            current_alloc_count:    s.current_alloc_count,
            current_alloc_size:     s.current_alloc_size,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoleakFdStats {
    pub total_open_count:   u64,
    pub total_close_count:  u64,
    pub current_open_count: u64,
}

impl From<FdStats> for SoleakFdStats {
    fn from(s: FdStats) -> Self {
        Self {
            total_open_count:   s.total_open_count,
            total_close_count:  s.total_close_count,
            current_open_count: s.current_open_count,
        }
    }
}

/// Hands a string to C. Interior NULs cannot cross; they become `?`.
fn to_c(s: String) -> *mut c_char {
    let c = CString::new(s).unwrap_or_else(|e| {
        let cleaned: Vec<u8> = e.into_vec().into_iter().map(|b| if b == 0 { b'?' } else { b }).collect();
        // No NULs left.
        CString::new(cleaned).unwrap_or_default()
    });
    c.into_raw()
}

unsafe fn from_c<'a>(p: *const c_char) -> Option<&'a Path> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok().map(Path::new)
}

#[no_mangle]
pub extern "C" fn soleak_init(debug: bool, backtrace: bool) -> c_int {
    init(debug, backtrace)
}

/// # Safety
/// `names` must be null or point to `count` pointers, each null or a
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn soleak_hook(names: *const *const c_char, count: usize) -> c_int {
    match collect_names(names, count) {
        Some(modules)   => hook(&modules),
        None            => Status::Invalid.code(),
    }
}

/// # Safety
/// As for [`soleak_hook`].
#[no_mangle]
pub unsafe extern "C" fn soleak_unhook(names: *const *const c_char, count: usize) -> c_int {
    match collect_names(names, count) {
        Some(modules)   => unhook(&modules),
        None            => Status::Invalid.code(),
    }
}

unsafe fn collect_names(names: *const *const c_char, count: usize) -> Option<Vec<String>> {
    if names.is_null() || count == 0 {
        return None;
    }
    let modules: Vec<String> = std::slice::from_raw_parts(names, count)
        .iter()
        .filter(|p| !p.is_null())
        .map(|&p| CStr::from_ptr(p).to_string_lossy().into_owned())
        .collect();
    if modules.is_empty() { None } else { Some(modules) }
}

#[no_mangle]
pub extern "C" fn soleak_unhook_all() -> c_int {
    unhook_all()
}

/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn soleak_get_memory_stats(out: *mut SoleakMemoryStats) -> c_int {
    if out.is_null() {
        return Status::Invalid.code();
    }
    out.write(get_memory_stats().into());
    Status::Ok.code()
}

/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn soleak_get_fd_stats(out: *mut SoleakFdStats) -> c_int {
    if out.is_null() {
        return Status::Invalid.code();
    }
    out.write(get_fd_stats().into());
    Status::Ok.code()
}

#[no_mangle]
pub extern "C" fn soleak_reset_stats() {
    reset_stats()
}

#[no_mangle]
pub extern "C" fn soleak_reset_fd_stats() {
    reset_fd_stats()
}

#[no_mangle]
pub extern "C" fn soleak_set_backtrace_enabled(on: bool) {
    set_backtrace_enabled(on)
}

#[no_mangle]
pub extern "C" fn soleak_is_backtrace_enabled() -> bool {
    is_backtrace_enabled()
}

/// Release with [`soleak_string_free`].
#[no_mangle]
pub extern "C" fn soleak_get_leak_report() -> *mut c_char {
    to_c(get_leak_report())
}

#[no_mangle]
pub extern "C" fn soleak_get_fd_leak_report() -> *mut c_char {
    to_c(get_fd_leak_report())
}

/// # Safety
/// `path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn soleak_dump_leak_report(path: *const c_char) -> c_int {
    dump_leak_report(from_c(path))
}

/// # Safety
/// `path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn soleak_dump_fd_leak_report(path: *const c_char) -> c_int {
    dump_fd_leak_report(from_c(path))
}

#[no_mangle]
pub extern "C" fn soleak_get_leaks_json() -> *mut c_char {
    to_c(get_leaks_json())
}

#[no_mangle]
pub extern "C" fn soleak_get_fd_leaks_json() -> *mut c_char {
    to_c(get_fd_leaks_json())
}

#[no_mangle]
pub extern "C" fn soleak_get_leaks_aggregated_json() -> *mut c_char {
    to_c(get_leaks_aggregated_json())
}

/// # Safety
/// `s` must be null or a string returned by one of the `soleak_get_*`
/// functions, not yet freed.
#[no_mangle]
pub unsafe extern "C" fn soleak_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
