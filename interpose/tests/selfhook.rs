//! Hooks this test binary itself: the Rust allocator reaches `malloc`
//! through the binary's own import slots.
use soleak::*;

#[test]
fn allocations_of_a_hooked_module_are_booked() {
    let exe = std::fs::read_link("/proc/self/exe").unwrap();
    let name = exe.file_name().unwrap().to_string_lossy().into_owned();

    // Blocks allocated before the hook are freed through it; keep them
    // out of the counters.
    std::env::set_var("SOLEAK_FREE_POLICY", "strict");
    assert_eq!(init(false, false), 0);
    assert_eq!(hook(&[name.as_str()]), 0);
    if !is_hooked(&name, Symbol::Malloc) {
        // Statically linked C library: no slots to patch.
        shutdown();
        return;
    }
    assert_eq!(get_hooked_modules(), vec![name.clone()]);

    let before = get_memory_stats();
    let block: Vec<u8> = Vec::with_capacity(1 << 20);
    let during = get_memory_stats();
    assert!(during.total_alloc_count > before.total_alloc_count);
    assert!(during.total_alloc_size >= before.total_alloc_size + (1 << 20));
    assert!(get_leak_report().contains("size=1048576"));
    drop(block);
    let s = get_memory_stats();
    assert!(s.total_free_size >= 1 << 20);
    assert_eq!(s.current_alloc_count, s.total_alloc_count - s.total_free_count);

    assert_eq!(unhook_all(), 0);
    assert!(get_hooked_modules().is_empty());
    let after = get_memory_stats();
    let again: Vec<u8> = Vec::with_capacity(1 << 20);
    assert_eq!(get_memory_stats().total_alloc_count, after.total_alloc_count);
    drop(again);

    shutdown();
}
