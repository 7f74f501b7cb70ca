//! Running a closure on a separate, harness-private stack.
//!
//! This is the only place the harness switches stacks by hand. The switch
//! saves the scheduler's stack pointer in the frame pointer register, loads
//! the isolated stack's top, calls a monomorphized trampoline and restores the
//! stack pointer on return. Panics never cross the switch: the trampoline
//! catches them and drops the payload before returning, so the payload's
//! allocation is released inside the iteration that made it.

use crate::{error::HarnessError, private_mem::PrivateMapping};
use libc::c_void;
use std::panic::{self, AssertUnwindSafe};

/// State the trampoline needs, on the caller's stack.
struct Frame<F, R> {
    f: Option<F>,
    result: Option<R>,
}

extern "C" fn trampoline<F, R>(data: *mut c_void)
where
    F: FnOnce() -> R,
{
    let frame = unsafe { &mut *(data as *mut Frame<F, R>) };
    if let Some(f) = frame.f.take() {
        // A panic leaves `result` at None; the payload is dropped right here.
        frame.result = panic::catch_unwind(AssertUnwindSafe(f)).ok();
    }
}

// `snapbench_switch_stack(data, entry, stack_top)` calls `entry(data)` with
// the stack pointer at `stack_top`. The caller's stack pointer is kept in the
// frame pointer register and the CFI describes the frame through it, so an
// unwinder walking up from `entry` (a backtrace taken by a panicking target)
// steps from the isolated stack back onto the caller's.
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl snapbench_switch_stack",
    ".hidden snapbench_switch_stack",
    ".type snapbench_switch_stack, @function",
    "snapbench_switch_stack:",
    ".cfi_startproc",
    "push rbp",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset rbp, -16",
    "mov rbp, rsp",
    ".cfi_def_cfa_register rbp",
    "mov rsp, rdx",
    "call rsi",
    "mov rsp, rbp",
    ".cfi_def_cfa_register rsp",
    "pop rbp",
    ".cfi_def_cfa_offset 8",
    "ret",
    ".cfi_endproc",
    ".size snapbench_switch_stack, . - snapbench_switch_stack",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl snapbench_switch_stack",
    ".hidden snapbench_switch_stack",
    ".type snapbench_switch_stack, %function",
    "snapbench_switch_stack:",
    ".cfi_startproc",
    "stp x29, x30, [sp, #-16]!",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset x29, -16",
    ".cfi_offset x30, -8",
    "mov x29, sp",
    ".cfi_def_cfa_register x29",
    "mov sp, x2",
    "blr x1",
    "mov sp, x29",
    ".cfi_def_cfa_register sp",
    "ldp x29, x30, [sp], #16",
    ".cfi_def_cfa_offset 0",
    ".cfi_restore x29",
    ".cfi_restore x30",
    "ret",
    ".cfi_endproc",
    ".size snapbench_switch_stack, . - snapbench_switch_stack",
);

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn snapbench_switch_stack(data: *mut c_void, entry: extern "C" fn(*mut c_void), stack_top: usize);
}

/// Call `entry(data)` with the stack pointer set to `stack_top`.
///
/// # Safety
/// `stack_top` must be the 16-byte aligned top of a mapped, writable region
/// large enough for everything `entry` does. `entry` must not unwind.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
unsafe fn switch_and_call(stack_top: usize, entry: extern "C" fn(*mut c_void), data: *mut c_void) {
    snapbench_switch_stack(data, entry, stack_top)
}

/// An isolated stack and the means to run code on it.
pub struct ExecutionContext {
    stack: PrivateMapping,
}

impl ExecutionContext {
    /// A context whose stack holds `stack_size` usable bytes above a guard page.
    pub fn new(stack_size: usize) -> Result<ExecutionContext, HarnessError> {
        if !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            return Err(HarnessError::ExecutionContext(
                "stack switching is only implemented for x86_64 and aarch64",
            ));
        }
        let stack = PrivateMapping::with_guard_page(stack_size).map_err(HarnessError::PrivateMemory)?;
        Ok(ExecutionContext { stack })
    }

    /// The whole stack mapping, guard page included.
    pub fn stack(&self) -> &PrivateMapping {
        &self.stack
    }

    /// Run `f` on the isolated stack. `None` if `f` panicked.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub fn call<F, R>(&mut self, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        let mut frame: Frame<F, R> = Frame {
            f: Some(f),
            result: None,
        };
        unsafe {
            switch_and_call(
                self.stack.top(),
                trampoline::<F, R>,
                &mut frame as *mut Frame<F, R> as *mut c_void,
            );
        }
        frame.result
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn call<F, R>(&mut self, _f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        unreachable!("ExecutionContext::new refuses this architecture")
    }
}
