//! The owned harness and its lifecycle:
//! construct -> normalize -> arm -> run(N)... -> teardown.

use crate::{
    address_space::{
        memory_region::{MemoryRegion, RegionEntry},
        normalizer_code_address,
        region_catalog::{ExclusionReason, RegionCatalog, RegionPolicy, Verdict},
        AddressSpaceNormalizer,
    },
    error::HarnessError,
    log::{LogDebug, LogError, LogInfo},
    monitor::{ProtectionMonitor, Userfaultfd},
    private_mem::{PrivateBox, PrivateVec},
    scheduler::{BenchRun, ExecutionScheduler, SchedulerOptions},
    target::Target,
    util::approximate_stack_pointer,
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Usable size of the stack the target runs on.
    pub target_stack_size: usize,
    pub monitor_stack_size: usize,
    /// How long to wait for the monitor to register and arm every region.
    pub arm_timeout: Duration,
    /// How long to wait, after the target returns, for the monitor to finish
    /// the last fault.
    pub drain_timeout: Duration,
    /// Checksum every monitored region before the first iteration and compare
    /// after every restore.
    pub verify_restore: bool,
    /// Write protect captured pages again after restoring them. Only turned
    /// off to show what goes wrong without it.
    pub rearm: bool,
    /// Snapshot store capacity to allocate up front, in pages.
    pub reserve_pages: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            target_stack_size: 8 * 1024 * 1024,
            monitor_stack_size: 256 * 1024,
            arm_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
            verify_restore: false,
            rearm: true,
            reserve_pages: 256,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HarnessState {
    Constructed,
    Normalized,
    Armed,
    TornDown,
}

impl HarnessState {
    pub fn as_str(self) -> &'static str {
        match self {
            HarnessState::Constructed => "constructed",
            HarnessState::Normalized => "normalized",
            HarnessState::Armed => "armed",
            HarnessState::TornDown => "torn down",
        }
    }
}

pub struct Harness {
    config: HarnessConfig,
    state: HarnessState,
    classified: Vec<(MemoryRegion, Verdict)>,
    monitored: Vec<MemoryRegion>,
    table: PrivateVec<RegionEntry>,
    monitor: ProtectionMonitor,
    scheduler: PrivateBox<ExecutionScheduler>,
}

impl Harness {
    /// Negotiate userfaultfd, allocate every private structure, then read the
    /// catalog and decide the monitored set. The catalog is read last so the
    /// private mappings it lists can be excluded.
    pub fn new<C: RegionCatalog + ?Sized>(
        config: HarnessConfig,
        catalog: &mut C,
    ) -> Result<Harness, HarnessError> {
        let uffd = Userfaultfd::negotiate()?;
        let mut monitor = ProtectionMonitor::new(uffd, config.monitor_stack_size)?;
        monitor.reserve_pages(config.reserve_pages)?;
        let scheduler = PrivateBox::new(ExecutionScheduler::new(
            config.target_stack_size,
            SchedulerOptions {
                drain_timeout: config.drain_timeout,
                rearm: config.rearm,
                verify_restore: config.verify_restore,
            },
        )?)
        .map_err(HarnessError::PrivateMemory)?;
        let mut table = PrivateVec::with_capacity(256).map_err(HarnessError::PrivateMemory)?;

        let regions = catalog.regions()?;

        let mut policy = RegionPolicy::new();
        let private_ranges = monitor
            .private_ranges()
            .into_iter()
            .chain(Some(scheduler.range()))
            .chain(Some(scheduler.context().stack().range()))
            .chain(table.range());
        for range in private_ranges {
            policy.exclude_range(range, ExclusionReason::HarnessPrivate);
        }
        policy
            .exclude_containing(approximate_stack_pointer(), ExclusionReason::SchedulerStack)
            .exclude_containing(normalizer_code_address(), ExclusionReason::HarnessCode);

        let classified = policy.classify(&regions);
        let monitored: Vec<MemoryRegion> = classified
            .iter()
            .filter(|(_, verdict)| *verdict == Verdict::Monitored)
            .map(|(region, _)| region.clone())
            .collect();
        for region in &monitored {
            table.push(region.entry()).map_err(HarnessError::PrivateMemory)?;
        }
        if is_logging!(LogDebug) {
            for (region, verdict) in &classified {
                log!(LogDebug, "{}: {}", region, verdict);
            }
        }
        log!(
            LogInfo,
            "{} of {} region piece(s) selected for monitoring",
            monitored.len(),
            classified.len()
        );

        Ok(Harness {
            config,
            state: HarnessState::Constructed,
            classified,
            monitored,
            table,
            monitor,
            scheduler,
        })
    }

    /// Construct, normalize and arm in one go.
    pub fn armed<C: RegionCatalog + ?Sized>(
        config: HarnessConfig,
        catalog: &mut C,
    ) -> Result<Harness, HarnessError> {
        let mut harness = Harness::new(config, catalog)?;
        harness.normalize()?;
        harness.arm()?;
        Ok(harness)
    }

    fn expect_state(&self, expected: HarnessState) -> Result<(), HarnessError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HarnessError::Lifecycle {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    /// Turn every monitored region into anonymous private memory in place.
    /// Must run before any other thread of the harness exists.
    pub fn normalize(&mut self) -> Result<(), HarnessError> {
        self.expect_state(HarnessState::Constructed)?;
        AddressSpaceNormalizer::normalize(&self.table, &self.monitored)?;
        self.state = HarnessState::Normalized;
        Ok(())
    }

    /// Start the monitor and wait until every region is write protected.
    pub fn arm(&mut self) -> Result<(), HarnessError> {
        self.expect_state(HarnessState::Normalized)?;
        self.monitor.arm(&self.table, self.config.arm_timeout)?;
        self.state = HarnessState::Armed;
        Ok(())
    }

    /// Run `target` `iterations` times, restoring monitored memory after each.
    /// Fails only when the harness is not armed; errors during the run end
    /// up in [`BenchRun::aborted`] next to the samples gathered so far.
    pub fn run<T: Target + ?Sized>(
        &mut self,
        target: &mut T,
        args: &[String],
        iterations: usize,
    ) -> Result<BenchRun, HarnessError> {
        self.expect_state(HarnessState::Armed)?;
        let run = self
            .scheduler
            .run(target, args, iterations, &self.monitor, &self.table);
        if let Some(e) = &run.aborted {
            log!(LogError, "run aborted after {} iteration(s): {}", run.samples.len(), e);
        }
        Ok(run)
    }

    /// Release every region and stop the monitor. Idempotent.
    pub fn teardown(&mut self) -> Result<(), HarnessError> {
        if self.state == HarnessState::TornDown {
            return Ok(());
        }
        self.state = HarnessState::TornDown;
        self.monitor.teardown()
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Every piece of the catalog with the policy's verdict.
    pub fn classified(&self) -> &[(MemoryRegion, Verdict)] {
        &self.classified
    }

    pub fn monitored(&self) -> &[MemoryRegion] {
        &self.monitored
    }

    pub fn monitor(&self) -> &ProtectionMonitor {
        &self.monitor
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log!(LogError, "teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address_space::{
            memory_range::MemoryRange,
            region_catalog::{FixedCatalog, ProcMapsCatalog},
        },
        private_mem::PrivateMapping,
        scheduler::IterationOutcome,
        target::{TargetFailure, PANIC_EXIT_CODE},
        util::page_size,
    };
    use nix::sys::mman::ProtFlags;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::ptr;

    fn buffer(pages: usize, fill: u8) -> PrivateMapping {
        let buf = PrivateMapping::new(pages * page_size()).unwrap();
        unsafe { ptr::write_bytes(buf.as_mut_ptr(), fill, buf.len()) };
        buf
    }

    fn region(buf: &PrivateMapping) -> MemoryRegion {
        MemoryRegion::anonymous(buf.range(), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
    }

    fn contents(buf: &PrivateMapping) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(buf.as_mut_ptr(), buf.len()) }.to_vec()
    }

    /// An armed harness over `bufs`, or `None` if userfaultfd write protection
    /// is not available here.
    fn harness_or_skip(test: &str, config: HarnessConfig, bufs: &[&PrivateMapping]) -> Option<Harness> {
        let mut catalog = FixedCatalog::new(bufs.iter().map(|b| region(b)).collect());
        match Harness::armed(config, &mut catalog) {
            Ok(h) => Some(h),
            Err(e @ HarnessError::Unsupported(_)) | Err(e @ HarnessError::Negotiation { .. }) => {
                eprintln!("skipping {}: {}", test, e);
                None
            }
            Err(e) => panic!("{}: {}", test, e),
        }
    }

    #[test]
    fn idempotent_restore_random_writes_test() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let buf = buffer(16, 0);
        unsafe {
            for i in 0..buf.len() {
                *buf.as_mut_ptr().add(i) = rng.gen();
            }
        }
        let before = contents(&buf);
        let config = HarnessConfig {
            verify_restore: true,
            ..HarnessConfig::default()
        };
        let mut harness = match harness_or_skip("idempotent_restore_random_writes_test", config, &[&buf]) {
            Some(h) => h,
            None => return,
        };
        let base = buf.as_mut_ptr() as usize;
        let len = buf.len();
        let mut target = |_: &[String]| -> Result<(), TargetFailure> {
            let writes = rng.gen_range(1..200);
            for _ in 0..writes {
                let off = rng.gen_range(0..len);
                unsafe { ptr::write_volatile((base + off) as *mut u8, rng.gen()) };
            }
            Ok(())
        };
        let run = harness.run(&mut target, &[], 20).unwrap();
        assert!(run.aborted.is_none(), "{:?}", run.aborted);
        assert_eq!(run.samples.len(), 20);
        assert!(run.samples.iter().all(|s| s.pages_restored >= 1));
        assert_eq!(contents(&buf), before);
        harness.teardown().unwrap();
    }

    #[test]
    fn iteration_isolation_test() {
        let buf = buffer(2, 0x5A);
        let mut harness = match harness_or_skip("iteration_isolation_test", HarnessConfig::default(), &[&buf]) {
            Some(h) => h,
            None => return,
        };
        let p = buf.as_mut_ptr() as usize;
        let mut seen = Vec::new();
        let mut target = |_: &[String]| -> Result<(), TargetFailure> {
            let first = unsafe { ptr::read_volatile(p as *const u64) };
            seen.push(first);
            unsafe { ptr::write_volatile(p as *mut u64, 0xdead_beef_dead_beef) };
            Ok(())
        };
        let run = harness.run(&mut target, &[], 10).unwrap();
        assert!(run.aborted.is_none());
        assert_eq!(seen, vec![0x5A5A_5A5A_5A5A_5A5A; 10]);
    }

    #[test]
    fn page_granularity_and_content_test() {
        let ps = page_size();
        let buf = buffer(8, 0);
        unsafe {
            for i in 0..buf.len() {
                *buf.as_mut_ptr().add(i) = (i / ps) as u8;
            }
        }
        let harness = match harness_or_skip("page_granularity_and_content_test", HarnessConfig::default(), &[&buf]) {
            Some(h) => h,
            None => return,
        };
        let page = buf.as_mut_ptr() as usize + 5 * ps;
        unsafe { ptr::write_volatile((page + 123) as *mut u8, 0xEE) };
        let monitor = harness.monitor();
        monitor.drain(Duration::from_secs(1)).unwrap();
        assert_eq!(monitor.captured_addresses(), vec![page]);
        let captured = monitor.captured_page(page).unwrap();
        assert_eq!(captured.len(), ps);
        assert!(captured.iter().all(|&b| b == 5));
    }

    #[test]
    fn single_byte_write_restores_one_page_test() {
        let buf = buffer(4, 1);
        let mut harness = match harness_or_skip("single_byte_write_restores_one_page_test", HarnessConfig::default(), &[&buf]) {
            Some(h) => h,
            None => return,
        };
        let p = buf.as_mut_ptr() as usize + page_size() + 17;
        let mut target = |_: &[String]| -> Result<(), TargetFailure> {
            unsafe { ptr::write_volatile(p as *mut u8, 2) };
            Ok(())
        };
        let run = harness.run(&mut target, &[], 5).unwrap();
        assert!(run.samples.iter().all(|s| s.pages_restored == 1));
        assert_eq!(unsafe { *(p as *const u8) }, 1);
    }

    #[test]
    fn no_cross_region_leakage_test() {
        let a = buffer(4, 0xA);
        let b = buffer(4, 0xB);
        let harness = match harness_or_skip("no_cross_region_leakage_test", HarnessConfig::default(), &[&a, &b]) {
            Some(h) => h,
            None => return,
        };
        unsafe {
            for i in (0..a.len()).step_by(997) {
                ptr::write_volatile(a.as_mut_ptr().add(i), 0);
            }
        }
        let monitor = harness.monitor();
        monitor.drain(Duration::from_secs(1)).unwrap();
        let captured = monitor.captured_addresses();
        assert!(!captured.is_empty());
        assert!(captured.iter().all(|&addr| a.range().contains_ptr(addr)));
        assert!(captured.iter().all(|&addr| !b.range().contains_ptr(addr)));
    }

    #[test]
    fn readiness_ordering_test() {
        let buf = buffer(1, 0);
        let mut catalog = FixedCatalog::new(vec![region(&buf)]);
        let mut harness = match Harness::new(HarnessConfig::default(), &mut catalog) {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skipping readiness_ordering_test: {}", e);
                return;
            }
        };
        let mut target = |_: &[String]| -> Result<(), TargetFailure> { Ok(()) };
        match harness.run(&mut target, &[], 1) {
            Err(HarnessError::Lifecycle { expected, actual }) => {
                assert_eq!(expected, "armed");
                assert_eq!(actual, "constructed");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(harness.arm().is_err());
        harness.normalize().unwrap();
        assert!(!harness.monitor().state().is_armed());
        harness.arm().unwrap();
        assert!(harness.monitor().state().is_armed());
        assert_eq!(harness.monitor().faults_handled(), 0);

        let p = buf.as_mut_ptr() as usize;
        let mut target = |_: &[String]| -> Result<(), TargetFailure> {
            unsafe { ptr::write_volatile(p as *mut u8, 1) };
            Ok(())
        };
        let run = harness.run(&mut target, &[], 3).unwrap();
        assert!(run.aborted.is_none());
        // One capture per iteration, none before the first.
        assert_eq!(harness.monitor().faults_handled(), 3);
    }

    fn regression_observations(test: &str, rearm: bool) -> Option<Vec<u32>> {
        let buf = buffer(1, 0);
        let x = buf.as_mut_ptr() as usize + 64;
        unsafe { ptr::write_volatile(x as *mut u32, 7) };
        let config = HarnessConfig {
            rearm,
            ..HarnessConfig::default()
        };
        let mut harness = harness_or_skip(test, config, &[&buf])?;
        let mut observed = Vec::new();
        let mut target = |_: &[String]| -> Result<(), TargetFailure> {
            observed.push(unsafe { ptr::read_volatile(x as *const u32) });
            unsafe { ptr::write_volatile(x as *mut u32, 99) };
            Ok(())
        };
        let run = harness.run(&mut target, &[], 3).unwrap();
        assert!(run.aborted.is_none());
        harness.teardown().unwrap();
        Some(observed)
    }

    #[test]
    fn regression_with_rearm_test() {
        if let Some(observed) = regression_observations("regression_with_rearm_test", true) {
            assert_eq!(observed, vec![7, 7, 7]);
        }
    }

    #[test]
    fn regression_without_rearm_shows_stale_value_test() {
        if let Some(observed) =
            regression_observations("regression_without_rearm_shows_stale_value_test", false)
        {
            // Iteration 2's write is never seen by the monitor, so iteration 3
            // starts from it.
            assert_eq!(observed, vec![7, 7, 99]);
        }
    }

    #[test]
    fn sample_count_and_outcomes_test() {
        let buf = buffer(1, 0);
        let mut harness = match harness_or_skip("sample_count_and_outcomes_test", HarnessConfig::default(), &[&buf]) {
            Some(h) => h,
            None => return,
        };
        let p = buf.as_mut_ptr() as usize;
        let mut calls = 0;
        let mut target = |args: &[String]| {
            calls += 1;
            unsafe { ptr::write_volatile(p as *mut u8, calls as u8) };
            match calls % 3 {
                0 => Err(TargetFailure::new(args.len() as i32)),
                1 => Ok(()),
                _ => panic!("iteration {} panicked", calls),
            }
        };
        let args = vec!["one".to_string(), "two".to_string()];
        let run = harness.run(&mut target, &args, 7).unwrap();
        assert!(run.aborted.is_none());
        assert_eq!(run.samples.len(), 7);
        let outcomes: Vec<IterationOutcome> = run.samples.iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                IterationOutcome::Completed,
                IterationOutcome::Failed(PANIC_EXIT_CODE),
                IterationOutcome::Failed(2),
                IterationOutcome::Completed,
                IterationOutcome::Failed(PANIC_EXIT_CODE),
                IterationOutcome::Failed(2),
                IterationOutcome::Completed,
            ]
        );
        assert_eq!(run.failures(), 4);
        assert_eq!(unsafe { *(p as *const u8) }, 0);
    }

    #[test]
    fn region_filtering_test() {
        let mut catalog = ProcMapsCatalog::new();
        // Construction only classifies; nothing is remapped.
        let harness = match Harness::new(HarnessConfig::default(), &mut catalog) {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skipping region_filtering_test: {}", e);
                return;
            }
        };
        let sp = approximate_stack_pointer();
        let code = normalizer_code_address();
        let target_stack = harness.scheduler.context().stack().range();
        let private: Vec<MemoryRange> = harness.monitor().private_ranges();
        for region in harness.monitored() {
            assert!(!region.is_pseudo_mapping(), "{}", region);
            assert!(!region.has_no_access(), "{}", region);
            assert!(!region.contains_ptr(sp), "{}", region);
            assert!(!region.contains_ptr(code), "{}", region);
            assert!(!region.intersects(&target_stack), "{}", region);
            for r in &private {
                assert!(!region.intersects(r), "{} overlaps {}", region, r);
            }
        }
        assert!(harness
            .classified()
            .iter()
            .any(|(_, v)| *v == Verdict::Excluded(ExclusionReason::HarnessCode)));
        assert_eq!(harness.monitored().len(), harness.table.len());
    }
}
