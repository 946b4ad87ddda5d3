//! `soleak`: finds memory and file-descriptor leaks in chosen shared
//! objects of a running process.
//!
//! Hooking a module rewrites its import slots for `malloc` and friends,
//! C++ `operator new`/`delete`, and the `open`/`fopen` families, so
//! that its calls land in [`wrappers`]. Each wrapper performs the real
//! call and books the outcome in the [`Engine`]'s ledgers, from which
//! statistics, text reports and JSON are produced on demand. Nothing
//! outside the hooked modules is affected.
//!
//! Use it from Rust through the functions re-exported from [`api`], or
//! from C through the `soleak_*` symbols of the `cdylib`.
#![allow(non_camel_case_types)]

/// C types and the signatures of the intercepted functions.
pub mod ffi;
pub mod symbols;
pub mod original;
pub mod installer;
pub mod elf;
pub mod wrappers;
pub mod config;
pub mod engine;
pub mod api;

pub use api::*;
pub use config::{Config, ConfigError};
pub use elf::PltInterceptor;
pub use engine::{Engine, Status, NOT_INITIALIZED_REPORT};
pub use installer::{HookError, HookRegistry, InstallSummary, Interceptor, Patch, Redirect};
pub use symbols::{Symbol, FD_SYMBOLS, MEMORY_SYMBOLS};
pub use ledger::{FdKey, FdStats, FreePolicy, MemoryStats, ShardStats, Tally};
