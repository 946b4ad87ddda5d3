use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use ledger::LeakGroup;
use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};

/// Loads a shared object, hooks its allocation and file calls, runs
/// one of its entry points and reports what it left behind.
#[derive(Parser, Debug)]
struct Arg {
    /// Shared object to load and hook
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    library:    PathBuf,

    /// Exported `void (void)` function to call
    #[arg(short, long)]
    entry:      Option<String>,

    /// How many times to call the entry point
    #[arg(short, long, default_value_t = 1)]
    calls:      u32,

    /// Capture a call stack for every allocation
    #[arg(short, long)]
    backtrace:  bool,

    /// Log every intercepted call
    #[arg(short, long)]
    debug:      bool,

    /// Print live allocations as JSON
    #[arg(long, group = "output")]
    json:       bool,

    /// Print live allocations grouped by call stack, as JSON
    #[arg(long, group = "output")]
    aggregated: bool,

    /// Print open descriptors and streams as JSON
    #[arg(long, group = "output")]
    fd_json:    bool,

    /// Also write the memory leak report here
    #[arg(long, value_parser = clap::value_parser!(PathBuf))]
    report:     Option<PathBuf>,

    /// Also write the descriptor leak report here
    #[arg(long, value_parser = clap::value_parser!(PathBuf))]
    fd_report:  Option<PathBuf>,

    /// Ignore frees and closes of things never seen allocated or opened
    #[arg(long)]
    strict:     bool,
}

fn dl_error() -> String {
    // SAFETY: `dlerror` returns null or a NUL-terminated string.
    let e = unsafe { libc::dlerror() };
    if e.is_null() {
        String::from("unknown error")
    } else {
        unsafe { CStr::from_ptr(e) }.to_string_lossy().into_owned()
    }
}

fn open_library(path: &Path) -> Result<*mut c_void> {
    let c = CString::new(path.as_os_str().as_encoded_bytes())
        .with_context(|| format!("{}: path contains a NUL byte", path.display()))?;
    let handle = unsafe { libc::dlopen(c.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
    if handle.is_null() {
        bail!("cannot load {}: {}", path.display(), dl_error());
    }
    Ok(handle)
}

fn entry_point(handle: *mut c_void, name: &str) -> Result<extern "C" fn()> {
    let c = CString::new(name).with_context(|| format!("bad symbol name `{}`", name))?;
    let sym = unsafe { libc::dlsym(handle, c.as_ptr()) };
    if sym.is_null() {
        bail!("no symbol `{}`: {}", name, dl_error());
    }
    // SAFETY: the caller promises a `void (void)` function.
    Ok(unsafe { std::mem::transmute::<*mut c_void, extern "C" fn()>(sym) })
}

fn check(status: i32, what: &str) -> Result<()> {
    match status {
        0   => Ok(()),
        -2  => {
            log::warn!("{}: engine was already initialized", what);
            Ok(())
        },
        s   => Err(anyhow!("{} failed with status {}", what, s)),
    }
}

fn main() -> Result<()> {
    let cli = Arg::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if cli.strict {
        std::env::set_var(soleak::config::ENV_FREE_POLICY, "strict");
    }
    let module = cli
        .library
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{}: not a file name", cli.library.display()))?
        .to_string();

    let handle = open_library(&cli.library)?;
    check(soleak::init(cli.debug, cli.backtrace), "init")?;
    check(soleak::hook(&[module.as_str()]), "hook")?;
    if soleak::get_hooked_modules().is_empty() {
        log::warn!("{}: none of its imports could be hooked", module);
    }

    if let Some(name) = &cli.entry {
        let f = entry_point(handle, name)?;
        for _ in 0..cli.calls {
            f();
        }
        log::info!("called `{}` {} time(s)", name, cli.calls);
    }

    println!("{}", soleak::get_memory_stats());
    println!("{}", soleak::get_fd_stats());
    if cli.json {
        println!("{}", soleak::get_leaks_json());
    } else if cli.aggregated {
        let json = soleak::get_leaks_aggregated_json();
        let groups: Vec<LeakGroup> = serde_json::from_str(&json)?;
        if let Some(top) = groups.first() {
            log::info!("{} leak site(s); largest holds {} bytes in {} block(s)", groups.len(), top.total_size, top.count);
        }
        println!("{}", json);
    } else if cli.fd_json {
        println!("{}", soleak::get_fd_leaks_json());
    } else {
        print!("{}", soleak::get_leak_report());
        print!("{}", soleak::get_fd_leak_report());
    }

    if let Some(p) = &cli.report {
        check(soleak::dump_leak_report(Some(p)), &format!("writing {}", p.display()))?;
    }
    if let Some(p) = &cli.fd_report {
        check(soleak::dump_fd_leak_report(Some(p)), &format!("writing {}", p.display()))?;
    }

    check(soleak::unhook_all(), "unhook")?;
    // Unhooked: nothing points into our wrappers any more.
    unsafe { libc::dlclose(handle) };
    Ok(())
}
