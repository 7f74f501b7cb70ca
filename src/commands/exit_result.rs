use snapbench::HarnessError;
use std::{
    error::Error,
    process::{ExitCode, Termination},
};
use thiserror::Error;

/// Exit status when the command line or environment is unusable.
pub const EXIT_USAGE: u8 = 1;
/// Exit status when the harness could not be set up.
pub const EXIT_SETUP: u8 = 2;
/// Exit status when a run stopped early or some iteration failed.
pub const EXIT_RUN: u8 = 3;

pub enum ExitResult<T: Termination> {
    Ok(T),
    Err(Box<dyn Error>, u8),
}

impl<T: Termination> ExitResult<T> {
    pub fn err_from<E: Error + 'static>(e: E, code: u8) -> ExitResult<T> {
        ExitResult::Err(Box::new(e), code)
    }

    /// A harness error, reported together with the sub-operation it came from.
    pub fn harness(e: HarnessError, code: u8) -> ExitResult<T> {
        ExitResult::err_from(
            PhaseError {
                phase: e.phase(),
                source: e,
            },
            code,
        )
    }
}

#[derive(Debug, Error)]
#[error("{phase} failed: {source}")]
pub struct PhaseError {
    phase: &'static str,
    source: HarnessError,
}

impl<T: Termination> Termination for ExitResult<T> {
    fn report(self) -> ExitCode {
        match self {
            ExitResult::Ok(t) => t.report(),
            ExitResult::Err(b, c) => {
                eprintln!("snapbench: {}", b);
                ExitCode::from(c)
            }
        }
    }
}
