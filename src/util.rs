use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::{sysconf, Pid, SysconfVar::PAGE_SIZE},
};
use std::{convert::TryInto, io};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

fn page_size_init() -> usize {
    match sysconf(PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz.try_into().unwrap_or(4096),
        // sysconf(_SC_PAGESIZE) cannot really fail on Linux.
        _ => 4096,
    }
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size<T: Into<usize> + From<usize>>(size: T) -> T {
    ((size.into() + page_size() - 1) & !(page_size() - 1)).into()
}

pub fn floor_page_size<T: Into<usize> + From<usize>>(sz: T) -> T {
    let page_mask: usize = !(page_size() - 1);
    (sz.into() & page_mask).into()
}

pub fn is_page_aligned(addr: usize) -> bool {
    addr & (page_size() - 1) == 0
}

/// Approximation of the current stack pointer: the address of a local.
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    // Keep `marker` on the stack instead of in a register.
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Pin the calling thread to `cpu`. The harness only ever runs the target on
/// the calling thread, so this is enough to keep iterations on one core.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(cpu)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set).map_err(io::Error::from)
}
