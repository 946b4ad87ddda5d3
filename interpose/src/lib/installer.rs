use crate::original;
use crate::symbols::Symbol;
use crate::wrappers;
use ahash::AHasher;
use indexmap::IndexMap;
use std::hash::BuildHasherDefault;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("module `{0}` is not loaded")]
    ModuleNotFound(String),
    #[error("`{module}` does not import `{symbol}`")]
    SymbolNotFound {
        module: String,
        symbol: &'static str,
    },
    #[error("cannot make `{symbol}` slot of `{module}` writable (errno {errno})")]
    Protect {
        module: String,
        symbol: &'static str,
        errno:  i32,
    },
}

/// One overwritten pointer slot and what it held before.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    pub slot:       usize,
    pub previous:   usize,
}

/// An active redirection of one symbol inside one module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub module:     String,
    pub symbol:     Symbol,
    /// The entry point the module was calling, if it was a real one
    /// (0 for lazy-binding stubs and the like).
    pub original:   usize,
    pub patches:    Vec<Patch>,
}

/// The hooking primitive: make `module`'s calls to `symbol` land on
/// `replacement`, and undo it again.
///
/// Implementations handle one (module, symbol) pair per call; the
/// [`HookRegistry`] serializes calls and keeps them idempotent.
pub trait Interceptor: Send + Sync {
    fn install(&self, module: &str, symbol: Symbol, replacement: usize) -> Result<Redirect, HookError>;
    fn remove(&self, redirect: &Redirect) -> Result<(), HookError>;
}

type HookBook = IndexMap<(String, Symbol), Redirect, BuildHasherDefault<AHasher>>;

/// What one `install` call achieved, per symbol.
#[derive(Debug, Default)]
pub struct InstallSummary {
    pub installed:  Vec<Symbol>,
    pub already:    Vec<Symbol>,
    pub failed:     Vec<(Symbol, HookError)>,
}

impl InstallSummary {
    pub fn module_missing(&self) -> bool {
        !self.failed.is_empty()
            && self.installed.is_empty()
            && self.already.is_empty()
            && self.failed.iter().all(|(_, e)| matches!(e, HookError::ModuleNotFound(_)))
    }
}

/// The set of currently hooked (module, symbol) pairs.
///
/// All installs and removals go through one lock, so no two of them
/// ever race on a pair. Wrappers never take it: a call that already
/// loaded its original pointer finishes normally even if the pair is
/// removed meanwhile.
pub struct HookRegistry {
    interceptor:    Box<dyn Interceptor>,
    active:         Mutex<HookBook>,
}

impl HookRegistry {
    pub fn new(interceptor: Box<dyn Interceptor>) -> Self {
        Self {
            interceptor,
            active: Mutex::new(HookBook::default()),
        }
    }

    fn book(&self) -> std::sync::MutexGuard<'_, HookBook> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Redirects each of `symbols` in `module`. Symbols fail
    /// independently; already hooked pairs are left alone.
    pub fn install(&self, module: &str, symbols: &[Symbol]) -> InstallSummary {
        let mut summary = InstallSummary::default();
        let mut book = self.book();
        for &sym in symbols {
            let key = (module.to_string(), sym);
            if book.contains_key(&key) {
                summary.already.push(sym);
                continue;
            }
            match self.interceptor.install(module, sym, wrappers::wrapper_for(sym)) {
                Ok(redirect)    => {
                    original::remember(sym, redirect.original);
                    book.insert(key, redirect);
                    summary.installed.push(sym);
                },
                Err(e)          => summary.failed.push((sym, e)),
            }
        }
        summary
    }

    /// Restores each of `symbols` in `module`. Returns how many pairs
    /// were actually restored; pairs never hooked count as done.
    pub fn remove(&self, module: &str, symbols: &[Symbol]) -> usize {
        let mut book = self.book();
        let mut restored = 0;
        for &sym in symbols {
            let key = (module.to_string(), sym);
            if let Some(redirect) = book.get(&key) {
                match self.interceptor.remove(redirect) {
                    Ok(())  => {
                        book.shift_remove(&key);
                        restored += 1;
                    },
                    Err(e)  => log::warn!("{}", e),
                }
            }
        }
        restored
    }

    /// Restores every hooked pair, most recent first.
    pub fn remove_all(&self) -> usize {
        let mut book = self.book();
        let mut restored = 0;
        while let Some((key, redirect)) = book.pop() {
            match self.interceptor.remove(&redirect) {
                Ok(())  => restored += 1,
                Err(e)  => log::warn!("{} ({:?} dropped from the registry)", e, key),
            }
        }
        restored
    }

    pub fn is_hooked(&self, module: &str, symbol: Symbol) -> bool {
        self.book().contains_key(&(module.to_string(), symbol))
    }

    /// Sorted names of modules with at least one active redirection.
    pub fn hooked_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.book().keys().map(|(m, _)| m.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.book().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
