use soleak::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Calls {
    installed:  Vec<(String, Symbol)>,
    removed:    Vec<(String, Symbol)>,
}

/// Pretends `libfoo.so` imports everything and `libbar.so` only
/// `malloc`/`free`. Nothing is patched for real.
struct FakeInterceptor {
    modules:    HashMap<&'static str, Vec<Symbol>>,
    calls:      Arc<Mutex<Calls>>,
}

impl FakeInterceptor {
    fn new(calls: Arc<Mutex<Calls>>) -> Self {
        let mut modules = HashMap::new();
        modules.insert("libfoo.so", Symbol::all().collect());
        modules.insert("libbar.so", vec![Symbol::Malloc, Symbol::Free]);
        Self { modules, calls }
    }
}

impl Interceptor for FakeInterceptor {
    fn install(&self, module: &str, symbol: Symbol, replacement: usize) -> Result<Redirect, HookError> {
        let imports = self.modules.get(module).ok_or_else(|| HookError::ModuleNotFound(module.to_string()))?;
        if !imports.contains(&symbol) {
            return Err(HookError::SymbolNotFound { module: module.to_string(), symbol: symbol.name() });
        }
        self.calls.lock().unwrap().installed.push((module.to_string(), symbol));
        Ok(Redirect {
            module: module.to_string(),
            symbol,
            original: 0,
            patches: vec![Patch { slot: 0x1000 + symbol.index() * 8, previous: replacement }],
        })
    }

    fn remove(&self, redirect: &Redirect) -> Result<(), HookError> {
        self.calls.lock().unwrap().removed.push((redirect.module.clone(), redirect.symbol));
        Ok(())
    }
}

fn fake_engine() -> (Engine, Arc<Mutex<Calls>>) {
    let calls = Arc::new(Mutex::new(Calls::default()));
    (Engine::new(Box::new(FakeInterceptor::new(calls.clone()))), calls)
}

fn ready(cfg: Config) -> (Engine, Arc<Mutex<Calls>>) {
    let (e, calls) = fake_engine();
    assert_eq!(e.init_with(cfg), Status::Ok);
    (e, calls)
}

fn temp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("soleak-test-{}-{}", std::process::id(), name));
    p
}

#[test]
fn status_codes() {
    assert_eq!(Status::Ok.code(), 0);
    assert_eq!(Status::Invalid.code(), -1);
    assert_eq!(Status::AlreadyInitialized.code(), -2);
    assert_eq!(Status::InitFailed.code(), -3);
}

#[test]
fn init_twice_reports_already_initialized() {
    let (e, _) = fake_engine();
    assert!(!e.is_initialized());
    assert_eq!(e.init(false, false), Status::Ok);
    assert!(e.is_initialized());
    assert_eq!(e.init(true, true), Status::AlreadyInitialized);
    // The second call changed nothing.
    assert!(!e.is_backtrace_enabled());
}

#[test]
fn hook_requires_init_and_names() {
    let (e, calls) = fake_engine();
    assert_eq!(e.hook(&["libfoo.so"]), Status::Invalid);
    assert_eq!(e.unhook(&["libfoo.so"]), Status::Invalid);
    assert_eq!(e.unhook_all(), Status::Invalid);
    assert!(calls.lock().unwrap().installed.is_empty());

    e.init_with(Config::default());
    assert_eq!(e.hook::<&str>(&[]), Status::Invalid);
    assert_eq!(e.unhook::<&str>(&[]), Status::Invalid);
}

#[test]
fn unknown_module_is_skipped() {
    let (e, _) = ready(Config::default());
    assert_eq!(e.hook(&["libnothere.so"]), Status::Ok);
    assert!(e.hooked_modules().is_empty());
    assert_eq!(e.hook(&["libnothere.so", "libfoo.so", ""]), Status::Ok);
    assert_eq!(e.hooked_modules(), vec!["libfoo.so".to_string()]);
}

#[test]
fn hooking_is_idempotent() {
    let (e, calls) = ready(Config::default());
    assert_eq!(e.hook(&["libfoo.so"]), Status::Ok);
    assert_eq!(calls.lock().unwrap().installed.len(), Symbol::COUNT);
    assert_eq!(e.hook(&["libfoo.so"]), Status::Ok);
    assert_eq!(calls.lock().unwrap().installed.len(), Symbol::COUNT);
    for sym in Symbol::all() {
        assert!(e.is_hooked("libfoo.so", sym), "{:?}", sym);
    }
}

#[test]
fn partial_imports_hook_what_exists() {
    let (e, _) = ready(Config::default());
    e.hook(&["libbar.so"]);
    assert!(e.is_hooked("libbar.so", Symbol::Malloc));
    assert!(e.is_hooked("libbar.so", Symbol::Free));
    assert!(!e.is_hooked("libbar.so", Symbol::Open));
    assert!(!e.is_hooked("libbar.so", Symbol::Calloc));
}

#[test]
fn unhook_restores_only_the_named_modules() {
    let (e, calls) = ready(Config::default());
    e.hook(&["libfoo.so", "libbar.so"]);
    assert_eq!(e.hooked_modules(), vec!["libbar.so".to_string(), "libfoo.so".to_string()]);

    assert_eq!(e.unhook(&["libnothing.so"]), Status::Ok);
    assert!(calls.lock().unwrap().removed.is_empty());

    assert_eq!(e.unhook(&["libbar.so"]), Status::Ok);
    assert_eq!(e.hooked_modules(), vec!["libfoo.so".to_string()]);
    assert_eq!(calls.lock().unwrap().removed.len(), 2);

    // Again: nothing left to restore.
    assert_eq!(e.unhook(&["libbar.so"]), Status::Ok);
    assert_eq!(calls.lock().unwrap().removed.len(), 2);
}

#[test]
fn unhook_all_keeps_the_ledgers() {
    let (e, calls) = ready(Config::default());
    e.hook(&["libfoo.so", "libbar.so"]);
    e.on_alloc(0x1000, 64, 0);
    e.on_open(FdKey::Fd(7), 7, Some("/tmp/x".into()), libc::O_RDONLY, 0);

    assert_eq!(e.unhook_all(), Status::Ok);
    assert!(e.hooked_modules().is_empty());
    assert_eq!(calls.lock().unwrap().removed.len(), Symbol::COUNT + 2);
    // Most recent first.
    assert_eq!(calls.lock().unwrap().removed[0], ("libbar.so".to_string(), Symbol::Free));

    assert_eq!(e.memory_stats().current_alloc_count, 1);
    assert_eq!(e.fd_stats().current_open_count, 1);
}

#[test]
fn uninitialized_engine_answers_with_empty_results() {
    let (e, _) = fake_engine();
    e.on_alloc(0x1000, 64, 0);
    e.on_open(FdKey::Fd(3), 3, None, 0, 0);
    assert_eq!(e.memory_stats(), MemoryStats::default());
    assert_eq!(e.fd_stats(), FdStats::default());
    assert_eq!(e.leak_report(), NOT_INITIALIZED_REPORT);
    assert_eq!(e.fd_leak_report(), NOT_INITIALIZED_REPORT);
    assert_eq!(e.leaks_json(), "[]");
    assert_eq!(e.leaks_aggregated_json(), "[]");
    assert_eq!(e.fd_leaks_json(), "[]");
    let p = temp_path("uninit.txt");
    assert_eq!(e.dump_leak_report(Some(p.as_path())), Status::Invalid);
    assert!(!p.exists());
}

#[test]
fn five_same_site_allocations_aggregate_to_one_group() {
    let (e, _) = ready(Config::default());
    for i in 0..5 {
        e.on_alloc(0x10_000 + i * 0x1000, 1024, 0);
    }
    let s = e.memory_stats();
    assert_eq!(s.current_alloc_count, 5);
    assert_eq!(s.current_alloc_size, 5120);

    let groups: serde_json::Value = serde_json::from_str(&e.leaks_aggregated_json()).unwrap();
    let groups = groups.as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["count"], 5);
    assert_eq!(groups[0]["totalSize"], 5120);

    let flat: serde_json::Value = serde_json::from_str(&e.leaks_json()).unwrap();
    assert_eq!(flat.as_array().unwrap().len(), 5);
    assert_eq!(flat[0]["size"], 1024);
}

#[test]
fn null_pointers_are_ignored() {
    let (e, _) = ready(Config::default());
    e.on_alloc(0, 100, 0);
    e.on_free(0);
    assert_eq!(e.memory_stats(), MemoryStats::default());
}

#[test]
fn realloc_paths_through_the_engine() {
    let (e, _) = ready(Config::default());
    let realloc = |old: usize, new: usize, size: Tally| {
        let seen = e.before_realloc(old);
        e.on_realloc(old, seen, new, size, 0);
    };
    // realloc(NULL, n)
    realloc(0, 0x1000, 100);
    assert_eq!(e.memory_stats().current_alloc_size, 100);
    // Grown in place.
    realloc(0x1000, 0x1000, 300);
    assert_eq!(e.memory_stats().current_alloc_size, 300);
    // Moved.
    realloc(0x1000, 0x2000, 50);
    let s = e.memory_stats();
    assert_eq!(s.current_alloc_count, 1);
    assert_eq!(s.current_alloc_size, 50);
    // Failed: the old block stays.
    realloc(0x2000, 0, 1 << 40);
    assert_eq!(e.memory_stats().current_alloc_size, 50);
    // realloc(p, 0)
    realloc(0x2000, 0, 0);
    let s = e.memory_stats();
    assert_eq!(s.current_alloc_count, 0);
    assert_eq!(s.current_alloc_size, 0);
    assert_eq!(s.current_alloc_count, s.total_alloc_count - s.total_free_count);
}

#[test]
fn late_realloc_leaves_a_reused_address_alone() {
    let (e, _) = ready(Config::default());
    // Thread A grows 0x1000; before it books, thread B is handed 0x1000.
    e.on_alloc(0x1000, 100, 0);
    let seen = e.before_realloc(0x1000);
    e.on_alloc(0x1000, 64, 0);
    e.on_realloc(0x1000, seen, 0x9000, 200, 0);
    let s = e.memory_stats();
    assert_eq!(s.current_alloc_count, 2);
    assert_eq!(s.current_alloc_size, 264);
    assert_eq!(s.current_alloc_count, s.total_alloc_count - s.total_free_count);
    let leaks: serde_json::Value = serde_json::from_str(&e.leaks_json()).unwrap();
    assert_eq!(leaks[0]["ptr"], "0x1000");
    assert_eq!(leaks[0]["size"], 64);
}

#[test]
fn free_policy_decides_untracked_frees() {
    let (e, _) = ready(Config::default());
    e.on_free(0xdead0);
    assert_eq!(e.memory_stats().total_free_count, 1);
    e.on_close(FdKey::Fd(42));
    assert_eq!(e.fd_stats().total_close_count, 1);

    let (e, _) = ready(Config::default().free_policy(FreePolicy::Strict));
    e.on_free(0xdead0);
    e.on_close(FdKey::Fd(42));
    assert_eq!(e.memory_stats().total_free_count, 0);
    assert_eq!(e.fd_stats().total_close_count, 0);
}

#[test]
fn descriptors_and_streams_are_tracked_apart() {
    let (e, _) = ready(Config::default());
    e.on_open(FdKey::Fd(5), 5, Some("/etc/hosts".into()), libc::O_RDONLY, 0);
    e.on_open(FdKey::Stream(0x7000), 6, Some("/tmp/log".into()), libc::O_WRONLY | libc::O_CREAT, 0);
    e.on_open(FdKey::Fd(8), 8, None, 0, 0);
    let s = e.fd_stats();
    assert_eq!(s.total_open_count, 3);
    assert_eq!(s.current_open_count, 3);

    let leaks: serde_json::Value = serde_json::from_str(&e.fd_leaks_json()).unwrap();
    let leaks = leaks.as_array().unwrap();
    assert_eq!(leaks.len(), 3);
    assert_eq!(leaks[0]["path"], "/etc/hosts");
    assert!(leaks[0].get("stream").is_none());
    assert_eq!(leaks[1]["stream"], "0x7000");
    assert_eq!(leaks[2]["path"], "<unknown>");

    // Closing the descriptor under a stream does not close the stream.
    e.on_close(FdKey::Fd(6));
    assert_eq!(e.fd_stats().current_open_count, 3);
    e.on_close(FdKey::Stream(0x7000));
    e.on_close(FdKey::Fd(5));
    e.on_close(FdKey::Fd(8));
    assert_eq!(e.fd_stats().current_open_count, 0);
    assert!(e.fd_leak_report().contains("No file descriptor leaks detected."));
}

#[test]
fn reports_and_dumps() {
    let (e, _) = ready(Config::default());
    assert!(e.leak_report().contains("No memory leaks detected."));
    e.on_alloc(0xabc000, 77, 0);
    let report = e.leak_report();
    assert!(report.starts_with("=== Memory Leak Report ==="), "{}", report);
    assert!(report.contains("ptr=0xabc000, size=77"), "{}", report);

    assert_eq!(e.dump_leak_report(None), Status::Invalid);
    assert_eq!(e.dump_leak_report(Some(PathBuf::from("").as_path())), Status::Invalid);
    assert_eq!(e.dump_leak_report(Some(PathBuf::from("/no/such/dir/leaks.txt").as_path())), Status::Invalid);

    let p = temp_path("leaks.txt");
    assert_eq!(e.dump_leak_report(Some(p.as_path())), Status::Ok);
    assert_eq!(std::fs::read_to_string(&p).unwrap(), report);
    std::fs::remove_file(&p).unwrap();

    let p = temp_path("fd-leaks.txt");
    assert_eq!(e.dump_fd_leak_report(Some(p.as_path())), Status::Ok);
    assert!(std::fs::read_to_string(&p).unwrap().starts_with("=== File Descriptor Leak Report ==="));
    std::fs::remove_file(&p).unwrap();
}

#[inline(never)]
fn allocate_here(e: &Engine, ptr: usize) {
    e.on_alloc(ptr, 16, 0);
}

#[test]
fn backtraces_follow_the_switch() {
    let (e, _) = ready(Config::default());
    allocate_here(&e, 0x1000);
    e.set_backtrace_enabled(true);
    assert!(e.is_backtrace_enabled());
    for i in 0..3 {
        allocate_here(&e, 0x2000 + i * 0x100);
    }
    let leaks: serde_json::Value = serde_json::from_str(&e.leaks_json()).unwrap();
    let leaks = leaks.as_array().unwrap();
    assert_eq!(leaks.len(), 4);
    // Records keep the stack they were booked with.
    assert!(leaks[0]["backtrace"].as_array().unwrap().is_empty());
    for l in &leaks[1..] {
        assert!(!l["backtrace"].as_array().unwrap().is_empty());
    }

    let groups: serde_json::Value = serde_json::from_str(&e.leaks_aggregated_json()).unwrap();
    let groups = groups.as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["count"], 3);
    assert_eq!(groups[0]["totalSize"], 48);

    assert!(e.leak_report().contains("Backtrace ("));
}

#[test]
fn reset_clears_one_ledger_at_a_time() {
    let (e, _) = ready(Config::default());
    e.on_alloc(0x1000, 8, 0);
    e.on_open(FdKey::Fd(4), 4, None, 0, 0);
    e.reset_stats();
    assert_eq!(e.memory_stats(), MemoryStats::default());
    assert_eq!(e.fd_stats().current_open_count, 1);
    e.reset_fd_stats();
    assert_eq!(e.fd_stats(), FdStats::default());
}

#[test]
fn shutdown_starts_over() {
    let (e, calls) = ready(Config::default().backtrace(true));
    e.hook(&["libfoo.so"]);
    e.on_alloc(0x1000, 8, 0);
    e.shutdown();
    assert!(!e.is_initialized());
    assert!(e.hooked_modules().is_empty());
    assert_eq!(calls.lock().unwrap().removed.len(), Symbol::COUNT);
    assert!(!e.is_backtrace_enabled());

    assert_eq!(e.init_with(Config::default()), Status::Ok);
    assert_eq!(e.memory_stats(), MemoryStats::default());
    // A second shutdown of a fresh session, and one more of none.
    e.shutdown();
    e.shutdown();
}

#[test]
fn concurrent_bookkeeping_stays_consistent() {
    let (e, _) = ready(Config::default());
    let e = Arc::new(e);
    let workers: Vec<_> = (0..10)
        .map(|t| {
            let e = e.clone();
            std::thread::spawn(move || {
                for i in 0..20 {
                    let p = 0x100_0000 * (t + 1) + i * 0x40;
                    e.on_alloc(p, 32, 0);
                    if i % 2 == 0 {
                        e.on_free(p);
                    }
                    let s = e.memory_stats();
                    assert_eq!(s.current_alloc_count, s.total_alloc_count - s.total_free_count);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    let s = e.memory_stats();
    assert_eq!(s.total_alloc_count, 200);
    assert_eq!(s.total_free_count, 100);
    assert_eq!(s.current_alloc_size, 100 * 32);
    assert_eq!(e.shard_stats().total_records, 100);
    assert_eq!(e.panics(), 0);
}

#[test]
fn idle_stats_read_identically_from_many_threads() {
    let (e, _) = ready(Config::default());
    for i in 0..37 {
        e.on_alloc(0x10_0000 + i * 0x40, 16 + i as Tally, 0);
    }
    e.on_free(0x10_0000);
    let e = Arc::new(e);
    let expected = e.memory_stats();
    let readers: Vec<_> = (0..10)
        .map(|_| {
            let e = e.clone();
            std::thread::spawn(move || (0..20).map(|_| e.memory_stats()).collect::<Vec<_>>())
        })
        .collect();
    for r in readers {
        let seen = r.join().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|s| *s == expected));
    }
    assert_eq!(expected.current_alloc_count, 36);
    assert_eq!(expected.current_alloc_count, expected.total_alloc_count - expected.total_free_count);
}

#[test]
fn config_from_lookup() {
    let vars = |pairs: &'static [(&'static str, &'static str)]| {
        move |k: &str| pairs.iter().find(|(n, _)| *n == k).map(|(_, v)| v.to_string())
    };

    let cfg = Config::from_lookup(vars(&[])).unwrap();
    assert_eq!(cfg, Config::default());

    let cfg = Config::from_lookup(vars(&[
        ("SOLEAK_DEBUG", "1"),
        ("SOLEAK_BACKTRACE", "yes"),
        ("SOLEAK_FREE_POLICY", "strict"),
        ("SOLEAK_MAX_FRAMES", "32"),
    ]))
    .unwrap();
    assert!(cfg.debug);
    assert!(cfg.backtrace);
    assert_eq!(cfg.free_policy, FreePolicy::Strict);
    assert_eq!(cfg.max_frames, 32);

    assert!(matches!(
        Config::from_lookup(vars(&[("SOLEAK_DEBUG", "maybe")])),
        Err(ConfigError::BadFlag { var: "SOLEAK_DEBUG", .. })
    ));
    assert!(matches!(
        Config::from_lookup(vars(&[("SOLEAK_FREE_POLICY", "lenient")])),
        Err(ConfigError::BadPolicy(_))
    ));
    assert!(matches!(Config::from_lookup(vars(&[("SOLEAK_MAX_FRAMES", "0")])), Err(ConfigError::BadFrames(_))));
    assert!(matches!(Config::from_lookup(vars(&[("SOLEAK_MAX_FRAMES", "65")])), Err(ConfigError::BadFrames(_))));

    assert_eq!(Config::default().max_frames(1000).max_frames, 64);
    assert_eq!(Config::default().max_frames(0).max_frames, 1);
}

#[test]
fn symbols_name_their_imports() {
    assert_eq!(Symbol::all().count(), Symbol::COUNT);
    assert_eq!(MEMORY_SYMBOLS.len() + FD_SYMBOLS.len(), Symbol::COUNT);
    assert_eq!(Symbol::Malloc.name(), "malloc");
    assert_eq!(Symbol::Open2.name(), "__open_2");
    assert_eq!(Symbol::DeleteArray.name(), "_ZdaPv");
    for sym in Symbol::all() {
        assert_eq!(Symbol::from_name(sym.name()), Some(sym));
        assert_eq!(sym.is_memory(), MEMORY_SYMBOLS.contains(&sym));
    }
    assert_eq!(Symbol::from_name("mmap"), None);
}

#[test]
fn plt_interceptor_on_missing_module() {
    let plt = PltInterceptor;
    assert_eq!(
        plt.install("libdefinitely-not-loaded.so", Symbol::Malloc, 0x1234),
        Err(HookError::ModuleNotFound("libdefinitely-not-loaded.so".to_string()))
    );
    // Restoring into a module that went away is a no-op.
    let gone = Redirect {
        module:     "libdefinitely-not-loaded.so".to_string(),
        symbol:     Symbol::Malloc,
        original:   0,
        patches:    vec![Patch { slot: 0x10, previous: 0x20 }],
    };
    assert_eq!(plt.remove(&gone), Ok(()));
}

#[test]
fn loaded_modules_include_the_c_library() {
    let mods = soleak::elf::loaded_modules();
    assert!(!mods.is_empty());
    assert!(mods.iter().any(|m| m.basename().starts_with("libc")));
    let exe = std::fs::read_link("/proc/self/exe").unwrap();
    assert!(mods.iter().any(|m| m.name == exe.to_string_lossy()));
}

#[test]
fn sealed_pages_stop_at_the_relro_end() {
    let page = soleak::elf::page_size();
    let Some(m) = soleak::elf::loaded_modules().into_iter().find(|m| m.relro().is_some()) else {
        return;
    };
    let (lo, hi) = m.relro().unwrap();
    let first = lo & !(page - 1);
    let tail = hi & !(page - 1);
    if first < tail {
        assert_eq!(m.page_protection(first, page), libc::PROT_READ);
        assert_eq!(m.page_protection(tail - page, page), libc::PROT_READ);
    }
    if hi % page != 0 {
        // The page holding an unaligned end was never sealed.
        assert_ne!(m.page_protection(tail, page) & libc::PROT_WRITE, 0);
    }
}
