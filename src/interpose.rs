//! Process-wide `mmap` override.
//!
//! With the `interpose` feature the final executable exports `mmap` (and the
//! glibc `mmap64` alias), so every call the executable makes through the
//! dynamic symbol goes to the raw syscall gateway instead of libc. File-backed
//! requests are forwarded unchanged.

use crate::raw_syscalls;
use libc::{c_int, c_void, off_t};

#[inline(always)]
unsafe fn forward(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    match raw_syscalls::mmap(addr, length, prot, flags, fd, offset) {
        Ok(p) => p,
        Err(errno) => {
            *libc::__errno_location() = errno as c_int;
            libc::MAP_FAILED
        }
    }
}

/// # Safety
/// Same contract as `mmap(2)`.
#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    forward(addr, length, prot, flags, fd, offset)
}

/// # Safety
/// Same contract as `mmap(2)`.
#[cfg(target_env = "gnu")]
#[no_mangle]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    forward(addr, length, prot, flags, fd, offset)
}

/// Whether calls to `mmap` from this executable resolve to the override.
/// Referencing this also keeps the override linked into binaries.
pub fn is_active() -> bool {
    libc::mmap as *const () as usize == mmap as *const () as usize
}
