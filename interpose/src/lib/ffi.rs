// C-reminiscent types.
pub type size_t     = libc::size_t;
pub type mode_t     = libc::mode_t;
pub type void       = libc::c_void;
pub type int        = libc::c_int;
pub type char       = libc::c_char;
pub type FILE       = libc::FILE;

pub use libc::{RTLD_DEFAULT, RTLD_NEXT, dlsym, fileno};

// Signatures of the intercepted functions, as the target modules call
// them.
pub type CMalloc        = unsafe extern "C" fn(size: size_t)                        -> *mut void;
pub type CCalloc        = unsafe extern "C" fn(nobj: size_t, size: size_t)          -> *mut void;
pub type CRealloc       = unsafe extern "C" fn(p: *mut void, size: size_t)          -> *mut void;
pub type CFree          = unsafe extern "C" fn(p: *mut void);
// `operator new` reports failure by throwing; let that unwind through.
pub type COperatorNew   = unsafe extern "C-unwind" fn(size: size_t)                 -> *mut void;
pub type COperatorDel   = unsafe extern "C" fn(p: *mut void);
// `open` is variadic. Callers put `mode` where a third argument goes,
// which on the supported ABIs is what a fixed third parameter reads.
pub type COpen          = unsafe extern "C" fn(path: *const char, flags: int, mode: mode_t) -> int;
pub type COpen2         = unsafe extern "C" fn(path: *const char, flags: int)       -> int;
pub type CClose         = unsafe extern "C" fn(fd: int)                             -> int;
pub type CFopen         = unsafe extern "C" fn(path: *const char, mode: *const char) -> *mut FILE;
pub type CFclose        = unsafe extern "C" fn(stream: *mut FILE)                   -> int;

/// Reads a possibly-null C string without taking ownership.
///
/// # Safety
/// `p` must be null or point to a NUL-terminated string that outlives
/// the call.
pub unsafe fn lossy_str(p: *const char) -> Option<String> {
    if p.is_null() {
        None
    } else {
        Some(std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned())
    }
}
