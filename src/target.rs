use std::fmt::{Display, Formatter, Result as FmtResult};

/// Exit code recorded for an iteration whose target panicked, matching the
/// status a panicking Rust program exits with.
pub const PANIC_EXIT_CODE: i32 = 101;

/// A target reported that this iteration failed. `code` plays the role an
/// exit status would for a standalone program.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TargetFailure {
    pub code: i32,
}

impl TargetFailure {
    pub fn new(code: i32) -> TargetFailure {
        TargetFailure { code }
    }
}

impl Display for TargetFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "target failed with code {}", self.code)
    }
}

/// The benchmarked routine.
///
/// `run` is invoked once per iteration with the same arguments, always from
/// the same starting memory content. It must return rather than exit the
/// process, must not create threads or child processes, and must not unmap
/// or move memory that existed before the harness armed.
pub trait Target {
    fn run(&mut self, args: &[String]) -> Result<(), TargetFailure>;
}

impl<F> Target for F
where
    F: FnMut(&[String]) -> Result<(), TargetFailure>,
{
    fn run(&mut self, args: &[String]) -> Result<(), TargetFailure> {
        self(args)
    }
}
