//! The iteration loop.
//!
//! Nothing in the loop allocates, logs or writes outside harness-private
//! memory, except what the target itself does. Every write the target makes
//! to monitored memory is undone before the next iteration starts.

pub mod execution_context;

use crate::{
    address_space::memory_region::RegionEntry,
    error::HarnessError,
    monitor::ProtectionMonitor,
    private_mem::PrivateVec,
    target::{Target, PANIC_EXIT_CODE},
};
use execution_context::ExecutionContext;
use serde::Serialize;
use std::{
    slice,
    time::{Duration, Instant},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub enum IterationOutcome {
    Completed,
    /// The target reported failure with this code, or panicked
    /// (`PANIC_EXIT_CODE`).
    Failed(i32),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub struct IterationSample {
    pub duration: Duration,
    pub outcome: IterationOutcome,
    pub pages_restored: usize,
}

/// Samples gathered by one call to `run`. `aborted` is set when the harness
/// itself failed mid-run; the samples before the failure are still here.
#[derive(Debug)]
pub struct BenchRun {
    pub samples: Vec<IterationSample>,
    pub aborted: Option<HarnessError>,
}

impl BenchRun {
    pub fn failures(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.outcome != IterationOutcome::Completed)
            .count()
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SchedulerOptions {
    pub drain_timeout: Duration,
    pub rearm: bool,
    pub verify_restore: bool,
}

/// Lives in harness-private memory: it is written on every iteration.
pub struct ExecutionScheduler {
    context: ExecutionContext,
    options: SchedulerOptions,
    samples: PrivateVec<IterationSample>,
    checksums: PrivateVec<u32>,
}

fn checksum(entry: &RegionEntry) -> u32 {
    let bytes = unsafe { slice::from_raw_parts(entry.range.start() as *const u8, entry.range.size()) };
    crc32fast::hash(bytes)
}

impl ExecutionScheduler {
    pub fn new(
        target_stack_size: usize,
        options: SchedulerOptions,
    ) -> Result<ExecutionScheduler, HarnessError> {
        Ok(ExecutionScheduler {
            context: ExecutionContext::new(target_stack_size)?,
            options,
            samples: PrivateVec::new(),
            checksums: PrivateVec::new(),
        })
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Checksum every region that is readable, so restores can be verified.
    fn take_checksums(&mut self, regions: &[RegionEntry]) -> Result<(), HarnessError> {
        self.checksums.clear();
        self.checksums
            .reserve(regions.len())
            .map_err(HarnessError::PrivateMemory)?;
        for entry in regions {
            let sum = if entry.prot & libc::PROT_READ != 0 {
                checksum(entry)
            } else {
                0
            };
            self.checksums.push(sum).map_err(HarnessError::PrivateMemory)?;
        }
        Ok(())
    }

    fn verify(&self, iteration: usize, regions: &[RegionEntry]) -> Result<(), HarnessError> {
        for (entry, &expected) in regions.iter().zip(self.checksums.iter()) {
            if entry.prot & libc::PROT_READ != 0 && checksum(entry) != expected {
                return Err(HarnessError::RestoreMismatch {
                    iteration,
                    region: entry.range,
                });
            }
        }
        Ok(())
    }

    /// Run `target` `iterations` times. `regions` is the monitored set,
    /// used only for restore verification.
    pub fn run<T: Target + ?Sized>(
        &mut self,
        target: &mut T,
        args: &[String],
        iterations: usize,
        monitor: &ProtectionMonitor,
        regions: &[RegionEntry],
    ) -> BenchRun {
        let aborted = self.run_loop(target, args, iterations, monitor, regions).err();
        BenchRun {
            samples: self.samples.to_vec(),
            aborted,
        }
    }

    fn run_loop<T: Target + ?Sized>(
        &mut self,
        target: &mut T,
        args: &[String],
        iterations: usize,
        monitor: &ProtectionMonitor,
        regions: &[RegionEntry],
    ) -> Result<(), HarnessError> {
        self.samples.clear();
        self.samples
            .reserve(iterations)
            .map_err(HarnessError::PrivateMemory)?;
        if self.options.verify_restore {
            self.take_checksums(regions)?;
        }
        // Whatever was written since arming (or since the last run) is the
        // starting state from here on.
        monitor.rebaseline(self.options.drain_timeout)?;

        for iteration in 0..iterations {
            let start = Instant::now();
            let outcome = match self.context.call(|| target.run(args)) {
                Some(Ok(())) => IterationOutcome::Completed,
                Some(Err(failure)) => IterationOutcome::Failed(failure.code),
                None => IterationOutcome::Failed(PANIC_EXIT_CODE),
            };
            monitor.drain(self.options.drain_timeout)?;
            let pages_restored = monitor.restore(self.options.rearm)?;
            let duration = start.elapsed();
            self.samples
                .push(IterationSample {
                    duration,
                    outcome,
                    pages_restored,
                })
                .map_err(HarnessError::PrivateMemory)?;
            if self.options.verify_restore {
                self.verify(iteration, regions)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::memory_range::MemoryRange;
    use crate::private_mem::PrivateMapping;
    use crate::util::page_size;

    #[test]
    fn failures_count_test() {
        let sample = |outcome| IterationSample {
            duration: Duration::from_micros(5),
            outcome,
            pages_restored: 0,
        };
        let run = BenchRun {
            samples: vec![
                sample(IterationOutcome::Completed),
                sample(IterationOutcome::Failed(1)),
                sample(IterationOutcome::Failed(PANIC_EXIT_CODE)),
            ],
            aborted: None,
        };
        assert_eq!(run.failures(), 2);
    }

    #[test]
    fn checksums_detect_changes_test() {
        let buf = PrivateMapping::new(page_size()).unwrap();
        let regions = [
            RegionEntry {
                range: buf.range(),
                prot: libc::PROT_READ | libc::PROT_WRITE,
            },
            RegionEntry {
                range: MemoryRange::new_range(0, page_size()),
                prot: libc::PROT_NONE,
            },
        ];
        let mut scheduler = ExecutionScheduler::new(
            64 * 1024,
            SchedulerOptions {
                drain_timeout: Duration::from_secs(1),
                rearm: true,
                verify_restore: true,
            },
        )
        .unwrap();
        scheduler.take_checksums(&regions).unwrap();
        assert!(scheduler.verify(0, &regions).is_ok());
        unsafe { *buf.as_mut_ptr().add(100) = 9 };
        match scheduler.verify(4, &regions) {
            Err(HarnessError::RestoreMismatch { iteration, region }) => {
                assert_eq!(iteration, 4);
                assert_eq!(region, buf.range());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
