use std::ffi::CStr;

/// Every function the engine knows how to stand in for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    Malloc,
    Calloc,
    Realloc,
    Free,
    /// `operator new(size_t)`
    New,
    /// `operator new[](size_t)`
    NewArray,
    /// `operator delete(void*)`
    Delete,
    /// `operator delete[](void*)`
    DeleteArray,
    Open,
    Open64,
    /// glibc's fortified `open` (`_FORTIFY_SOURCE`).
    Open2,
    Close,
    Fopen,
    Fopen64,
    Fclose,
}

pub const MEMORY_SYMBOLS: &[Symbol] = &[
    Symbol::Malloc,
    Symbol::Calloc,
    Symbol::Realloc,
    Symbol::Free,
    Symbol::New,
    Symbol::NewArray,
    Symbol::Delete,
    Symbol::DeleteArray,
];

pub const FD_SYMBOLS: &[Symbol] = &[
    Symbol::Open,
    Symbol::Open64,
    Symbol::Open2,
    Symbol::Close,
    Symbol::Fopen,
    Symbol::Fopen64,
    Symbol::Fclose,
];

impl Symbol {
    pub const COUNT: usize = 15;

    pub fn all() -> impl Iterator<Item = Symbol> {
        MEMORY_SYMBOLS.iter().chain(FD_SYMBOLS).copied()
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The linker-visible name, mangled where C++ mangles it.
    pub fn name(self) -> &'static str {
        self.c_name().to_str().unwrap_or_default()
    }

    pub fn c_name(self) -> &'static CStr {
        match self {
            Symbol::Malloc      => c"malloc",
            Symbol::Calloc      => c"calloc",
            Symbol::Realloc     => c"realloc",
            Symbol::Free        => c"free",
            #[cfg(target_pointer_width = "64")]
            Symbol::New         => c"_Znwm",
            #[cfg(target_pointer_width = "64")]
            Symbol::NewArray    => c"_Znam",
            #[cfg(target_pointer_width = "32")]
            Symbol::New         => c"_Znwj",
            #[cfg(target_pointer_width = "32")]
            Symbol::NewArray    => c"_Znaj",
            Symbol::Delete      => c"_ZdlPv",
            Symbol::DeleteArray => c"_ZdaPv",
            Symbol::Open        => c"open",
            Symbol::Open64      => c"open64",
            Symbol::Open2       => c"__open_2",
            Symbol::Close       => c"close",
            Symbol::Fopen       => c"fopen",
            Symbol::Fopen64     => c"fopen64",
            Symbol::Fclose      => c"fclose",
        }
    }

    pub fn from_name(name: &str) -> Option<Symbol> {
        Symbol::all().find(|s| s.name() == name)
    }

    pub fn is_memory(self) -> bool {
        MEMORY_SYMBOLS.contains(&self)
    }
}
