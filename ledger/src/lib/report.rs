use crate::utils::*;
use crate::alloc::MemorySnapshot;
use crate::fd::FdSnapshot;
use crate::stack::{Stack, Symbolizer};
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;

pub const MEMORY_TITLE: &str    = "=== Memory Leak Report ===";
pub const FD_TITLE: &str        = "=== File Descriptor Leak Report ===";
pub const NO_MEMORY_LEAKS: &str = "No memory leaks detected.";
pub const NO_FD_LEAKS: &str     = "No file descriptor leaks detected.";

fn push_stack(out: &mut String, stack: &Stack, sym: &Symbolizer) {
    if stack.is_empty() {
        return;
    }
    let _ = writeln!(out, "  Backtrace ({} frames):", stack.len());
    for (j, line) in sym.render_long(stack).iter().enumerate() {
        let _ = writeln!(out, "    #{}: {}", j, line);
    }
}

/// Renders the human-readable memory report. Header numbers come from
/// the same snapshot as the listed records.
pub fn memory_report(snap: &MemorySnapshot, sym: &Symbolizer) -> String {
    let s = &snap.stats;
    let mut out = String::with_capacity(256 + snap.records.len() * 64);
    let _ = writeln!(out, "{}", MEMORY_TITLE);
    let _ = writeln!(out, "Total Allocations: {} ({} bytes)", s.total_alloc_count, s.total_alloc_size);
    let _ = writeln!(out, "Total Frees: {} ({} bytes)", s.total_free_count, s.total_free_size);
    let _ = writeln!(out, "Current Leaks: {} ({} bytes)", s.current_alloc_count, s.current_alloc_size);
    out.push('\n');
    if snap.records.is_empty() {
        let _ = writeln!(out, "{}", NO_MEMORY_LEAKS);
        return out;
    }
    for (i, rec) in snap.records.iter().enumerate() {
        let _ = writeln!(out, "Leak #{}: ptr={:#x}, size={}", i + 1, rec.ptr, rec.size);
        push_stack(&mut out, &rec.stack, sym);
    }
    out
}

pub fn fd_report(snap: &FdSnapshot, sym: &Symbolizer) -> String {
    let s = &snap.stats;
    let mut out = String::with_capacity(256 + snap.records.len() * 96);
    let _ = writeln!(out, "{}", FD_TITLE);
    let _ = writeln!(out, "Total opened: {}", s.total_open_count);
    let _ = writeln!(out, "Total closed: {}", s.total_close_count);
    let _ = writeln!(out, "Currently open: {}", s.current_open_count);
    out.push('\n');
    if snap.records.is_empty() {
        let _ = writeln!(out, "{}", NO_FD_LEAKS);
        return out;
    }
    let _ = writeln!(out, "Open file descriptors:");
    for (i, rec) in snap.records.iter().enumerate() {
        let _ = write!(out, "[{}] FD={}, Path={}, Flags={:#x}", i + 1, rec.fd, rec.path, rec.flags);
        if let Some(h) = rec.stream() {
            let _ = write!(out, ", Stream={:#x}", h);
        }
        out.push('\n');
        push_stack(&mut out, &rec.stack, sym);
    }
    out
}

/// Checks that `path` can plausibly be written to, without touching
/// the filesystem beyond a metadata lookup of its parent.
pub fn check_destination(path: &Path) -> Result<(), DumpError> {
    if path.as_os_str().is_empty() {
        return Err(DumpError::EmptyPath);
    }
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Ok(()),
        Some(p) if p.is_dir()               => Ok(()),
        _                                   => Err(DumpError::MissingParent(path.to_path_buf())),
    }
}

/// Writes `contents` to `path` through a temporary sibling that is
/// renamed into place. On any failure the temporary is removed and the
/// destination is left as it was.
pub fn dump(path: &Path, contents: &str) -> Result<(), DumpError> {
    check_destination(path)?;
    let io_err = |source| DumpError::Io { path: path.to_path_buf(), source };

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| DumpError::MissingParent(path.to_path_buf()))?;
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = path.with_file_name(tmp_name);

    let written = fs::File::create(&tmp).and_then(|mut f| {
        f.write_all(contents.as_bytes())?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    log::info!("report written to {}", path.display());
    Ok(())
}
