//! Where the real implementations live.
//!
//! The first entry point seen in a patched slot is remembered for the
//! rest of the process; later installs into other modules reuse it.
//! A wrapper reached before any install (or after a lazy-binding stub
//! was found in the slot) resolves through `dlsym`.
use crate::ffi::*;
use crate::symbols::Symbol;
use std::sync::atomic::{AtomicUsize, Ordering};

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicUsize = AtomicUsize::new(0);
static ORIGINALS: [AtomicUsize; Symbol::COUNT] = [EMPTY; Symbol::COUNT];

/// Remembers `addr` as the real `sym` unless one is already known.
/// Addresses of our own wrappers are never taken.
pub fn remember(sym: Symbol, addr: usize) {
    if addr == 0 || addr == crate::wrappers::wrapper_for(sym) {
        return;
    }
    let _ = ORIGINALS[sym.index()].compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire);
}

/// The real `sym`, or 0 if nothing in the process provides it.
pub fn address(sym: Symbol) -> usize {
    let known = ORIGINALS[sym.index()].load(Ordering::Acquire);
    if known != 0 {
        return known;
    }
    // `dlsym` is thread-safe. Racing resolvers find the same answer.
    let found = match unsafe { dlsym(RTLD_NEXT, sym.c_name().as_ptr()) } as usize {
        // Loaded with `dlopen`, the C library may precede us.
        0   => (unsafe { dlsym(RTLD_DEFAULT, sym.c_name().as_ptr()) }) as usize,
        a   => a,
    };
    let found = match (found, sym) {
        (0, Symbol::New | Symbol::NewArray)         => address(Symbol::Malloc),
        (0, Symbol::Delete | Symbol::DeleteArray)   => address(Symbol::Free),
        (0, Symbol::Open64 | Symbol::Open2)         => address(Symbol::Open),
        (0, Symbol::Fopen64)                        => address(Symbol::Fopen),
        (a, _)                                      => a,
    };
    if found == 0 {
        log::warn!("no implementation of `{}` found", sym.name());
        return 0;
    }
    remember(sym, found);
    ORIGINALS[sym.index()].load(Ordering::Acquire)
}

macro_rules! typed_original {
    ($( $(#[$doc:meta])* $getter:ident: $sym:expr => $ty:ty; )*) => {
        $(
            $(#[$doc])*
            #[inline]
            pub fn $getter() -> Option<$ty> {
                match address($sym) {
                    0   => None,
                    // SAFETY: `address` only hands out entry points of
                    // the named function, whose C signature is `$ty`.
                    a   => Some(unsafe { std::mem::transmute::<usize, $ty>(a) }),
                }
            }
        )*
    };
}

typed_original! {
    malloc:         Symbol::Malloc      => CMalloc;
    calloc:         Symbol::Calloc      => CCalloc;
    realloc:        Symbol::Realloc     => CRealloc;
    free:           Symbol::Free        => CFree;
    /// Falls back to `malloc` in processes without a C++ runtime.
    new:            Symbol::New         => COperatorNew;
    new_array:      Symbol::NewArray    => COperatorNew;
    delete:         Symbol::Delete      => COperatorDel;
    delete_array:   Symbol::DeleteArray => COperatorDel;
    open:           Symbol::Open        => COpen;
    open64:         Symbol::Open64      => COpen;
    open_2:         Symbol::Open2       => COpen2;
    close:          Symbol::Close       => CClose;
    fopen:          Symbol::Fopen       => CFopen;
    fopen64:        Symbol::Fopen64     => CFopen;
    fclose:         Symbol::Fclose      => CFclose;
}
