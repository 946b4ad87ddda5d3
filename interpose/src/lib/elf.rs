//! GOT patching. A module calls an imported function through a pointer
//! slot the dynamic linker filled in (`JUMP_SLOT` for calls through the
//! PLT, `GLOB_DAT` for address-taken imports). Overwriting those slots
//! redirects that one module and nothing else.
use crate::installer::{HookError, Interceptor, Patch, Redirect};
use crate::symbols::Symbol;
use once_cell::sync::Lazy;
use std::ffi::CStr;
use std::mem::size_of;
use std::os::raw::{c_char, c_int, c_void};

const PT_LOAD: u32          = 1;
const PT_DYNAMIC: u32       = 2;
const PT_GNU_RELRO: u32     = 0x6474_e552;

const PF_X: u32             = 1;
const PF_W: u32             = 2;
const PF_R: u32             = 4;

const DT_NULL: isize        = 0;
const DT_PLTRELSZ: isize    = 2;
const DT_STRTAB: isize      = 5;
const DT_SYMTAB: isize      = 6;
const DT_RELA: isize        = 7;
const DT_RELASZ: isize      = 8;
const DT_REL: isize         = 17;
const DT_RELSZ: isize       = 18;
const DT_PLTREL: isize      = 20;
const DT_JMPREL: isize      = 23;

#[cfg(target_arch = "x86_64")]
const R_JUMP_SLOT: u32 = 7;
#[cfg(target_arch = "x86_64")]
const R_GLOB_DAT: u32 = 6;
#[cfg(target_arch = "aarch64")]
const R_JUMP_SLOT: u32 = 1026;
#[cfg(target_arch = "aarch64")]
const R_GLOB_DAT: u32 = 1025;
#[cfg(target_arch = "x86")]
const R_JUMP_SLOT: u32 = 7;
#[cfg(target_arch = "x86")]
const R_GLOB_DAT: u32 = 6;
#[cfg(target_arch = "arm")]
const R_JUMP_SLOT: u32 = 22;
#[cfg(target_arch = "arm")]
const R_GLOB_DAT: u32 = 21;
// Elsewhere no relocation matches and every install reports
// `SymbolNotFound`.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86", target_arch = "arm")))]
const R_JUMP_SLOT: u32 = u32::MAX;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86", target_arch = "arm")))]
const R_GLOB_DAT: u32 = u32::MAX;

#[repr(C)]
struct Dyn {
    d_tag:  isize,
    d_val:  usize,
}

#[cfg(target_pointer_width = "64")]
#[allow(dead_code)]
#[repr(C)]
struct Sym {
    st_name:    u32,
    st_info:    u8,
    st_other:   u8,
    st_shndx:   u16,
    st_value:   u64,
    st_size:    u64,
}

#[cfg(target_pointer_width = "32")]
#[allow(dead_code)]
#[repr(C)]
struct Sym {
    st_name:    u32,
    st_value:   u32,
    st_size:    u32,
    st_info:    u8,
    st_other:   u8,
    st_shndx:   u16,
}

#[repr(C)]
struct Rel {
    r_offset:   usize,
    r_info:     usize,
}

#[allow(dead_code)]
#[repr(C)]
struct Rela {
    r_offset:   usize,
    r_info:     usize,
    r_addend:   isize,
}

#[cfg(target_pointer_width = "64")]
#[inline(always)]
fn r_sym(info: usize) -> usize { info >> 32 }
#[cfg(target_pointer_width = "64")]
#[inline(always)]
fn r_type(info: usize) -> u32 { (info & 0xffff_ffff) as u32 }
#[cfg(target_pointer_width = "32")]
#[inline(always)]
fn r_sym(info: usize) -> usize { info >> 8 }
#[cfg(target_pointer_width = "32")]
#[inline(always)]
fn r_type(info: usize) -> u32 { (info & 0xff) as u32 }

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0  => n as usize,
        _           => 4096,
    }
});

/// A loaded object as `dl_iterate_phdr` reports it.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    /// Path as the loader knows it; the main program's is filled in
    /// from `/proc/self/exe`.
    pub name:   String,
    /// Load bias.
    pub base:   usize,
    dynamic:    usize,
    relro:      Option<(usize, usize)>,
    // `PT_LOAD` ranges with the protection they were mapped with.
    loads:      Vec<(usize, usize, c_int)>,
}

#[derive(Default)]
struct DynInfo {
    strtab:     usize,
    symtab:     usize,
    jmprel:     usize,
    pltrelsz:   usize,
    plt_rela:   bool,
    rela:       usize,
    relasz:     usize,
    rel:        usize,
    relsz:      usize,
}

impl ModuleInfo {
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Full paths match exactly, bare names match the basename.
    pub fn matches(&self, wanted: &str) -> bool {
        if wanted.contains('/') {
            self.name == wanted
        } else {
            self.basename() == wanted
        }
    }

    pub fn owns(&self, addr: usize) -> bool {
        self.loads.iter().any(|&(lo, hi, _)| (lo..hi).contains(&addr))
    }

    /// The `PT_GNU_RELRO` range, if the module has one.
    pub fn relro(&self) -> Option<(usize, usize)> {
        self.relro
    }

    /// Protection the loader left on the page at `page_start`. It seals
    /// only the pages lying wholly below the RELRO end; a page holding
    /// that end keeps its segment's protection.
    pub fn page_protection(&self, page_start: usize, page: usize) -> c_int {
        if let Some((lo, hi)) = self.relro {
            let (lo, hi) = (lo & !(page - 1), hi & !(page - 1));
            if page_start >= lo && page_start + page <= hi {
                return libc::PROT_READ;
            }
        }
        let page_end = page_start + page;
        let prot = self
            .loads
            .iter()
            .filter(|&&(lo, hi, _)| lo < page_end && page_start < hi)
            .fold(0, |acc, &(_, _, p)| acc | p);
        if prot == 0 { libc::PROT_READ | libc::PROT_WRITE } else { prot }
    }

    // Some loaders leave dynamic-section pointers unrelocated.
    fn fix(&self, p: usize) -> usize {
        if p != 0 && p < self.base { p + self.base } else { p }
    }

    unsafe fn read_dynamic(&self) -> DynInfo {
        let mut d = DynInfo {
            plt_rela: cfg!(target_pointer_width = "64"),
            ..DynInfo::default()
        };
        let mut entry = self.dynamic as *const Dyn;
        loop {
            let e = &*entry;
            match e.d_tag {
                DT_NULL     => break,
                DT_STRTAB   => d.strtab = self.fix(e.d_val),
                DT_SYMTAB   => d.symtab = self.fix(e.d_val),
                DT_JMPREL   => d.jmprel = self.fix(e.d_val),
                DT_PLTRELSZ => d.pltrelsz = e.d_val,
                DT_PLTREL   => d.plt_rela = e.d_val as isize == DT_RELA,
                DT_RELA     => d.rela = self.fix(e.d_val),
                DT_RELASZ   => d.relasz = e.d_val,
                DT_REL      => d.rel = self.fix(e.d_val),
                DT_RELSZ    => d.relsz = e.d_val,
                _           => {},
            }
            entry = entry.add(1);
        }
        d
    }

    unsafe fn scan(&self, d: &DynInfo, table: usize, size: usize, rela: bool, name: &[u8], out: &mut Vec<usize>) {
        if table == 0 || size == 0 {
            return;
        }
        let count = size / if rela { size_of::<Rela>() } else { size_of::<Rel>() };
        for i in 0..count {
            let (offset, info) = if rela {
                let r = &*(table as *const Rela).add(i);
                (r.r_offset, r.r_info)
            } else {
                let r = &*(table as *const Rel).add(i);
                (r.r_offset, r.r_info)
            };
            let ty = r_type(info);
            if ty != R_JUMP_SLOT && ty != R_GLOB_DAT {
                continue;
            }
            let idx = r_sym(info);
            if idx == 0 {
                continue;
            }
            let sym = &*(d.symtab as *const Sym).add(idx);
            let sname = CStr::from_ptr((d.strtab + sym.st_name as usize) as *const c_char);
            if sname.to_bytes() == name {
                let slot = self.base.wrapping_add(offset);
                if !out.contains(&slot) {
                    out.push(slot);
                }
            }
        }
    }

    /// Addresses of every GOT slot through which this module reaches
    /// `name`.
    pub fn slots_for(&self, name: &[u8]) -> Vec<usize> {
        let mut out = vec![];
        if self.dynamic == 0 {
            return out;
        }
        // SAFETY: `dynamic` and every table it points to belong to a
        // module the loader reported as mapped.
        unsafe {
            let d = self.read_dynamic();
            if d.strtab == 0 || d.symtab == 0 {
                return out;
            }
            self.scan(&d, d.jmprel, d.pltrelsz, d.plt_rela, name, &mut out);
            self.scan(&d, d.rela, d.relasz, true, name, &mut out);
            self.scan(&d, d.rel, d.relsz, false, name, &mut out);
        }
        out
    }
}

fn segment_prot(flags: u32) -> c_int {
    let mut prot = libc::PROT_NONE;
    if flags & PF_R != 0 { prot |= libc::PROT_READ; }
    if flags & PF_W != 0 { prot |= libc::PROT_WRITE; }
    if flags & PF_X != 0 { prot |= libc::PROT_EXEC; }
    prot
}

unsafe extern "C" fn collect(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> c_int {
    let out = &mut *(data as *mut Vec<ModuleInfo>);
    let info = &*info;
    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };
    let base = info.dlpi_addr as usize;
    let mut m = ModuleInfo { name, base, dynamic: 0, relro: None, loads: vec![] };
    for i in 0..info.dlpi_phnum as usize {
        let ph = &*info.dlpi_phdr.add(i);
        let start = base.wrapping_add(ph.p_vaddr as usize);
        let end = start.wrapping_add(ph.p_memsz as usize);
        match ph.p_type {
            PT_LOAD         => m.loads.push((start, end, segment_prot(ph.p_flags))),
            PT_DYNAMIC      => m.dynamic = start,
            PT_GNU_RELRO    => m.relro = Some((start, end)),
            _               => {},
        }
    }
    out.push(m);
    0
}

/// Every object currently mapped into the process.
pub fn loaded_modules() -> Vec<ModuleInfo> {
    let mut mods: Vec<ModuleInfo> = Vec::new();
    // SAFETY: `collect` only writes into `mods`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut mods as *mut Vec<ModuleInfo> as *mut c_void);
    }
    if let Some(main) = mods.iter_mut().find(|m| m.name.is_empty()) {
        if let Ok(exe) = std::fs::read_link("/proc/self/exe") {
            main.name = exe.to_string_lossy().into_owned();
        }
    }
    mods
}

pub fn find_module(wanted: &str) -> Option<ModuleInfo> {
    loaded_modules().into_iter().find(|m| m.matches(wanted))
}

/// Stores `value` into the pointer slot at `slot`, lifting write
/// protection for the duration. The page then gets back the protection
/// the loader left on it.
unsafe fn write_slot(m: &ModuleInfo, slot: usize, value: usize) -> Result<(), c_int> {
    let page = *PAGE_SIZE;
    let page_start = slot & !(page - 1);
    let start = page_start as *mut c_void;
    let rw = libc::PROT_READ | libc::PROT_WRITE;
    if libc::mprotect(start, page, rw) != 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
    }
    std::ptr::write_volatile(slot as *mut usize, value);
    let prot = m.page_protection(page_start, page);
    if prot != rw {
        libc::mprotect(start, page, prot);
    }
    Ok(())
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// The default [`Interceptor`]: patches the import slots of modules
/// already loaded in this process. Modules loaded later are not
/// touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PltInterceptor;

impl Interceptor for PltInterceptor {
    fn install(&self, module: &str, symbol: Symbol, replacement: usize) -> Result<Redirect, HookError> {
        let m = find_module(module).ok_or_else(|| HookError::ModuleNotFound(module.to_string()))?;
        let slots = m.slots_for(symbol.c_name().to_bytes());
        if slots.is_empty() {
            return Err(HookError::SymbolNotFound { module: module.to_string(), symbol: symbol.name() });
        }

        let mut patches: Vec<Patch> = Vec::with_capacity(slots.len());
        for slot in slots {
            // SAFETY: `slot` is a pointer-sized GOT entry of a mapped
            // module.
            let previous = unsafe { std::ptr::read_volatile(slot as *const usize) };
            if let Err(errno) = unsafe { write_slot(&m, slot, replacement) } {
                for p in patches.iter().rev() {
                    let _ = unsafe { write_slot(&m, p.slot, p.previous) };
                }
                return Err(HookError::Protect { module: module.to_string(), symbol: symbol.name(), errno });
            }
            patches.push(Patch { slot, previous });
        }

        // A slot still pointing into its own module holds a lazy-binding
        // stub, not the function.
        let original = patches
            .iter()
            .map(|p| p.previous)
            .find(|&a| a != 0 && a != replacement && !m.owns(a))
            .unwrap_or(0);
        log::debug!(
            "{}: {} slot(s) of `{}` redirected (original {:#x})",
            m.basename(),
            patches.len(),
            symbol.name(),
            original
        );
        Ok(Redirect { module: module.to_string(), symbol, original, patches })
    }

    fn remove(&self, redirect: &Redirect) -> Result<(), HookError> {
        let m = match find_module(&redirect.module) {
            Some(m) if redirect.patches.iter().all(|p| m.owns(p.slot)) => m,
            // Unloaded (or replaced) since: nothing left to restore.
            _ => return Ok(()),
        };
        for p in redirect.patches.iter().rev() {
            // SAFETY: as in `install`; the module is still mapped.
            unsafe { write_slot(&m, p.slot, p.previous) }.map_err(|errno| HookError::Protect {
                module: redirect.module.clone(),
                symbol: redirect.symbol.name(),
                errno,
            })?;
        }
        Ok(())
    }
}
