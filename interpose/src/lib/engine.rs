use crate::config::Config;
use crate::elf::PltInterceptor;
use crate::installer::{HookRegistry, Interceptor};
use crate::original;
use crate::symbols::Symbol;
use crate::wrappers::Quiet;
use ledger::{
    json, report, AllocLedger, Capturer, FdKey, FdLedger, FdStats, MemoryStats, ShardStats, Symbolizer, Tally,
    UNKNOWN_PATH,
};
use std::os::raw::c_int;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Result codes of the facade operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok                  = 0,
    /// Bad argument, engine not initialized, or a failed dump.
    Invalid             = -1,
    /// `init` on an initialized engine. Callers treat it as success.
    AlreadyInitialized  = -2,
    /// The real `malloc`/`free` could not be located.
    InitFailed          = -3,
}

impl Status {
    pub fn code(self) -> c_int {
        self as c_int
    }
}

impl From<Status> for c_int {
    fn from(s: Status) -> c_int {
        s.code()
    }
}

pub const NOT_INITIALIZED_REPORT: &str = "soleak: not initialized\n";

/// Everything one leak-tracking session owns: the ledgers, the stack
/// capture switch, the symbolizer and the hooks.
///
/// The process-wide instance lives in [`crate::api`]; tests build their
/// own around a fake [`Interceptor`].
pub struct Engine {
    initialized:    AtomicBool,
    debug:          AtomicBool,
    panics:         AtomicU64,
    lifecycle:      Mutex<()>,
    capturer:       Capturer,
    allocs:         AllocLedger,
    fds:            FdLedger,
    symbolizer:     Symbolizer,
    hooks:          HookRegistry,
}

impl Engine {
    pub fn new(interceptor: Box<dyn Interceptor>) -> Self {
        Self {
            initialized:    AtomicBool::new(false),
            debug:          AtomicBool::new(false),
            panics:         AtomicU64::new(0),
            lifecycle:      Mutex::new(()),
            capturer:       Capturer::default(),
            allocs:         AllocLedger::default(),
            fds:            FdLedger::default(),
            symbolizer:     Symbolizer::new(),
            hooks:          HookRegistry::new(interceptor),
        }
    }

    pub fn with_plt() -> Self {
        Self::new(Box::new(PltInterceptor))
    }

    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// `init(debug, backtrace)`: environment settings with the two
    /// flags overridden.
    pub fn init(&self, debug: bool, backtrace: bool) -> Status {
        let cfg = Config::from_env().unwrap_or_else(|e| {
            log::warn!("ignoring environment settings: {}", e);
            Config::default()
        });
        self.init_with(cfg.debug(debug).backtrace(backtrace))
    }

    pub fn init_with(&self, cfg: Config) -> Status {
        let _q = Quiet::enter();
        let _l = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_initialized() {
            return Status::AlreadyInitialized;
        }
        if original::address(Symbol::Malloc) == 0 || original::address(Symbol::Free) == 0 {
            log::error!("cannot locate the real malloc/free");
            return Status::InitFailed;
        }
        self.debug.store(cfg.debug, Ordering::Relaxed);
        self.capturer.set_max_frames(cfg.max_frames);
        self.capturer.set_enabled(cfg.backtrace);
        self.allocs.set_policy(cfg.free_policy);
        self.fds.set_policy(cfg.free_policy);
        self.initialized.store(true, Ordering::Release);
        log::info!(
            "initialized (debug: {}, backtrace: {}, free policy: {:?}, max frames: {})",
            cfg.debug,
            cfg.backtrace,
            cfg.free_policy,
            self.capturer.max_frames()
        );
        Status::Ok
    }

    /// Hooks every known symbol in each of `modules`. Modules that are
    /// not loaded, or lack some of the symbols, are logged and skipped.
    pub fn hook<S: AsRef<str>>(&self, modules: &[S]) -> Status {
        let _q = Quiet::enter();
        if !self.is_initialized() || modules.is_empty() {
            return Status::Invalid;
        }
        let symbols: Vec<Symbol> = Symbol::all().collect();
        for module in modules.iter().map(AsRef::as_ref) {
            if module.is_empty() {
                log::warn!("skipping empty module name");
                continue;
            }
            let summary = self.hooks.install(module, &symbols);
            if summary.module_missing() {
                log::warn!("{}: not loaded, nothing hooked", module);
                continue;
            }
            for (sym, e) in &summary.failed {
                log::debug!("{}: `{}` not hooked: {}", module, sym.name(), e);
            }
            log::info!(
                "{}: {} symbol(s) hooked, {} already hooked",
                module,
                summary.installed.len(),
                summary.already.len()
            );
        }
        Status::Ok
    }

    pub fn unhook<S: AsRef<str>>(&self, modules: &[S]) -> Status {
        let _q = Quiet::enter();
        if !self.is_initialized() || modules.is_empty() {
            return Status::Invalid;
        }
        let symbols: Vec<Symbol> = Symbol::all().collect();
        for module in modules.iter().map(AsRef::as_ref) {
            let n = self.hooks.remove(module, &symbols);
            log::info!("{}: {} symbol(s) unhooked", module, n);
        }
        Status::Ok
    }

    pub fn unhook_all(&self) -> Status {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return Status::Invalid;
        }
        let n = self.hooks.remove_all();
        log::info!("all modules unhooked ({} redirection(s) restored)", n);
        Status::Ok
    }

    pub fn is_hooked(&self, module: &str, symbol: Symbol) -> bool {
        self.hooks.is_hooked(module, symbol)
    }

    pub fn hooked_modules(&self) -> Vec<String> {
        let _q = Quiet::enter();
        self.hooks.hooked_modules()
    }

    /* Bookkeeping. Called by the wrappers, but usable directly. */

    pub fn on_alloc(&self, ptr: usize, size: Tally, anchor: usize) {
        let _q = Quiet::enter();
        if ptr == 0 || !self.is_initialized() {
            return;
        }
        let stack = self.capturer.capture(anchor);
        self.allocs.record_alloc(ptr, size, stack);
        if self.debug() {
            log::debug!("alloc {:#x} ({} bytes)", ptr, size);
        }
    }

    pub fn on_free(&self, ptr: usize) {
        let _q = Quiet::enter();
        if ptr == 0 || !self.is_initialized() {
            return;
        }
        let freed = self.allocs.record_free(ptr);
        if self.debug() {
            log::debug!("free {:#x} ({:?} bytes)", ptr, freed);
        }
    }

    /// Notes which record `old` holds, ahead of the real `realloc`.
    pub fn before_realloc(&self, old: usize) -> Option<u64> {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return None;
        }
        self.allocs.seq_of(old)
    }

    /// `seen` comes from [`Engine::before_realloc`] on the same call.
    pub fn on_realloc(&self, old: usize, seen: Option<u64>, new: usize, size: Tally, anchor: usize) {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return;
        }
        // Only fresh records get a stack.
        let stack = if new != 0 && new != old { self.capturer.capture(anchor) } else { Default::default() };
        let outcome = self.allocs.record_realloc(old, seen, new, size, stack);
        if self.debug() {
            log::debug!("realloc {:#x} -> {:#x} ({} bytes): {:?}", old, new, size, outcome);
        }
    }

    pub fn on_open(&self, key: FdKey, fd: c_int, path: Option<String>, flags: c_int, anchor: usize) {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return;
        }
        let stack = self.capturer.capture(anchor);
        let path = path.unwrap_or_else(|| UNKNOWN_PATH.to_string());
        if self.debug() {
            log::debug!("open {:?} fd={} {} flags={:#x}", key, fd, path, flags);
        }
        self.fds.record_open(key, fd, &path, flags, stack);
    }

    pub fn on_close(&self, key: FdKey) {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return;
        }
        let closed = self.fds.record_close(key);
        if self.debug() {
            log::debug!("close {:?} (tracked: {})", key, closed.is_some());
        }
    }

    pub(crate) fn note_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Bookkeeping panics swallowed so far.
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /* Queries. */

    pub fn memory_stats(&self) -> MemoryStats {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return MemoryStats::default();
        }
        self.allocs.stats()
    }

    pub fn fd_stats(&self) -> FdStats {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return FdStats::default();
        }
        self.fds.stats()
    }

    pub fn shard_stats(&self) -> ShardStats {
        let _q = Quiet::enter();
        self.allocs.shard_stats()
    }

    pub fn reset_stats(&self) {
        let _q = Quiet::enter();
        if self.is_initialized() {
            self.allocs.reset();
            self.symbolizer.clear();
            log::info!("memory statistics reset");
        }
    }

    pub fn reset_fd_stats(&self) {
        let _q = Quiet::enter();
        if self.is_initialized() {
            self.fds.reset();
            log::info!("file descriptor statistics reset");
        }
    }

    pub fn set_backtrace_enabled(&self, on: bool) {
        if self.capturer.set_enabled(on) != on {
            log::info!("backtrace capture {}", if on { "enabled" } else { "disabled" });
        }
    }

    pub fn is_backtrace_enabled(&self) -> bool {
        self.capturer.is_enabled()
    }

    pub fn leak_report(&self) -> String {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return NOT_INITIALIZED_REPORT.to_string();
        }
        report::memory_report(&self.allocs.snapshot(), &self.symbolizer)
    }

    pub fn fd_leak_report(&self) -> String {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return NOT_INITIALIZED_REPORT.to_string();
        }
        report::fd_report(&self.fds.snapshot(), &self.symbolizer)
    }

    fn dump(&self, path: Option<&Path>, render: impl FnOnce() -> String) -> Status {
        let _q = Quiet::enter();
        let Some(path) = path else { return Status::Invalid };
        if !self.is_initialized() {
            return Status::Invalid;
        }
        if let Err(e) = report::check_destination(path) {
            log::warn!("{}", e);
            return Status::Invalid;
        }
        match report::dump(path, &render()) {
            Ok(())  => Status::Ok,
            Err(e)  => {
                log::warn!("{}", e);
                Status::Invalid
            }
        }
    }

    pub fn dump_leak_report(&self, path: Option<&Path>) -> Status {
        self.dump(path, || self.leak_report())
    }

    pub fn dump_fd_leak_report(&self, path: Option<&Path>) -> Status {
        self.dump(path, || self.fd_leak_report())
    }

    pub fn leaks_json(&self) -> String {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return String::from("[]");
        }
        json::leaks_json(&self.allocs.snapshot(), &self.symbolizer)
    }

    pub fn leaks_aggregated_json(&self) -> String {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return String::from("[]");
        }
        json::aggregated_json(&self.allocs.snapshot(), &self.symbolizer)
    }

    pub fn fd_leaks_json(&self) -> String {
        let _q = Quiet::enter();
        if !self.is_initialized() {
            return String::from("[]");
        }
        json::fd_leaks_json(&self.fds.snapshot(), &self.symbolizer)
    }

    /// Unhooks everything, empties both ledgers and returns to the
    /// uninitialized state. A later `init` starts a fresh session.
    pub fn shutdown(&self) {
        let _q = Quiet::enter();
        let _l = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_initialized() {
            return;
        }
        let n = self.hooks.remove_all();
        self.initialized.store(false, Ordering::Release);
        self.allocs.reset();
        self.fds.reset();
        self.symbolizer.clear();
        self.capturer.set_enabled(false);
        log::info!("shut down ({} redirection(s) restored)", n);
    }
}
