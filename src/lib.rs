//! Benchmark a function many times, each time from byte-identical memory.
//!
//! The harness turns the monitored part of the address space into anonymous
//! private memory, write protects it with userfaultfd and runs the target on
//! an isolated stack. A monitor thread copies every page the target writes
//! just before the write lands; after each iteration the copies are written
//! back and the pages protected again.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[cfg(test)]
#[macro_use]
extern crate memoffset;

#[macro_use]
pub mod log;
pub mod address_space;
mod bindings;
pub mod error;
pub mod harness;
#[cfg(feature = "interpose")]
pub mod interpose;
pub mod monitor;
pub mod private_mem;
pub mod raw_syscalls;
pub mod report;
pub mod scheduler;
mod scoped_fd;
pub mod target;
pub mod util;

pub use error::HarnessError;
pub use harness::{Harness, HarnessConfig};
pub use scheduler::{BenchRun, IterationOutcome, IterationSample};
pub use target::{Target, TargetFailure};
