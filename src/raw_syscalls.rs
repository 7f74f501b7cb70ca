//! The raw syscall gateway.
//!
//! This is the only module allowed to enter the kernel for `mmap`, `mprotect`
//! and `munmap`. It never goes through libc: the address space normalizer runs
//! while libc's own text may be unmapped, and the `mmap` interposer would
//! recurse into itself if it called the libc wrapper.
//!
//! Everything here is `#[inline(always)]` or a leaf so nothing outside the
//! harness's own code pages is touched.

use libc::{c_int, c_long, c_void, off_t};
use nix::errno::Errno;

/// Kernel return values in `[-4095, -1]` are negated errnos.
const MAX_ERRNO: usize = 4095;

#[cfg(target_arch = "x86_64")]
#[inline(always)]
unsafe fn syscall6(
    nr: c_long,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> usize {
    let ret: usize;
    std::arch::asm!(
        "syscall",
        inlateout("rax") nr as usize => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        in("r8") a5,
        in("r9") a6,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack)
    );
    ret
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn syscall6(
    nr: c_long,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> usize {
    let ret: usize;
    std::arch::asm!(
        "svc 0",
        in("x8") nr as usize,
        inlateout("x0") a1 => ret,
        in("x1") a2,
        in("x2") a3,
        in("x3") a4,
        in("x4") a5,
        in("x5") a6,
        options(nostack)
    );
    ret
}

/// Other architectures go through libc's generic `syscall(2)`. That is still
/// outside the interposed `mmap` symbol, but it does execute libc text, so the
/// normalizer cannot remap libc safely there.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
unsafe fn syscall6(
    nr: c_long,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> usize {
    let ret = libc::syscall(nr, a1, a2, a3, a4, a5, a6);
    if ret == -1 {
        (-(Errno::last_raw() as isize)) as usize
    } else {
        ret as usize
    }
}

#[inline(always)]
fn check(ret: usize) -> Result<usize, Errno> {
    if ret > usize::MAX - MAX_ERRNO {
        Err(Errno::from_raw(-(ret as isize) as i32))
    } else {
        Ok(ret)
    }
}

/// `mmap(2)` without libc.
///
/// # Safety
/// Same contract as `mmap(2)`; with `MAP_FIXED` it silently replaces whatever
/// was mapped at `addr`.
#[inline(always)]
pub unsafe fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> Result<*mut c_void, Errno> {
    check(syscall6(
        libc::SYS_mmap,
        addr as usize,
        len,
        prot as usize,
        flags as usize,
        fd as usize,
        offset as usize,
    ))
    .map(|r| r as *mut c_void)
}

/// `mprotect(2)` without libc.
///
/// # Safety
/// Same contract as `mprotect(2)`.
#[inline(always)]
pub unsafe fn mprotect(addr: *mut c_void, len: usize, prot: c_int) -> Result<(), Errno> {
    check(syscall6(
        libc::SYS_mprotect,
        addr as usize,
        len,
        prot as usize,
        0,
        0,
        0,
    ))
    .map(|_| ())
}

/// `munmap(2)` without libc.
///
/// # Safety
/// Same contract as `munmap(2)`: nothing may reference the range afterwards.
#[inline(always)]
pub unsafe fn munmap(addr: *mut c_void, len: usize) -> Result<(), Errno> {
    check(syscall6(libc::SYS_munmap, addr as usize, len, 0, 0, 0, 0)).map(|_| ())
}

/// Anonymous private read/write mapping anywhere in the address space.
///
/// # Safety
/// The caller owns the returned mapping and must unmap it.
#[inline(always)]
pub unsafe fn map_anonymous(len: usize) -> Result<*mut c_void, Errno> {
    mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    )
}

/// Anonymous private read/write mapping placed exactly at `addr`.
///
/// # Safety
/// Replaces any existing mapping in `[addr, addr + len)`.
#[inline(always)]
pub unsafe fn map_anonymous_fixed(addr: *mut c_void, len: usize) -> Result<*mut c_void, Errno> {
    mmap(
        addr,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    )
}
