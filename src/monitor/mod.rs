//! The protection monitor: a dedicated thread that registers every monitored
//! region for userfaultfd write-protect faults, then captures each page on
//! its first write and lets the writer continue.
//!
//! After the armed signal the monitor thread only touches harness-private
//! memory (its own stack, the control block, the snapshot store) and reads
//! monitored pages. It never allocates and never logs. Any error in the
//! fault loop is fatal: a writer is stalled in the kernel waiting for us, so
//! the thread writes a fixed message to stderr and aborts the process.

pub mod snapshot_store;
pub mod uffd;

use crate::{
    address_space::{memory_range::MemoryRange, memory_region::RegionEntry},
    error::HarnessError,
    log::{LogDebug, LogInfo},
    private_mem::{PrivateBox, PrivateMapping, PrivateVec},
    scoped_fd::ScopedFd,
    util::page_size,
};
use libc::c_void;
use nix::errno::Errno;
use snapshot_store::SnapshotStore;
use std::{
    cell::UnsafeCell,
    fmt::{Display, Formatter, Result as FmtResult},
    mem, ptr,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Condvar, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};
pub use uffd::{probe_features, Userfaultfd};

/// The uffd operation a registration or teardown error came from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegistrationStage {
    Register,
    WriteProtect,
    Unprotect,
    Unregister,
}

impl Display for RegistrationStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            RegistrationStage::Register => "UFFDIO_REGISTER",
            RegistrationStage::WriteProtect => "UFFDIO_WRITEPROTECT",
            RegistrationStage::Unprotect => "UFFDIO_WRITEPROTECT (clear)",
            RegistrationStage::Unregister => "UFFDIO_UNREGISTER",
        };
        f.write_str(s)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MonitorState {
    Init = 0,
    Registered = 1,
    Armed = 2,
    Listening = 3,
    Capturing = 4,
    Unprotecting = 5,
    Failed = 6,
    Stopped = 7,
}

impl MonitorState {
    fn from_u8(v: u8) -> MonitorState {
        match v {
            0 => MonitorState::Init,
            1 => MonitorState::Registered,
            2 => MonitorState::Armed,
            3 => MonitorState::Listening,
            4 => MonitorState::Capturing,
            5 => MonitorState::Unprotecting,
            6 => MonitorState::Failed,
            _ => MonitorState::Stopped,
        }
    }

    /// Tracking is established and the target may run.
    pub fn is_armed(self) -> bool {
        match self {
            MonitorState::Armed
            | MonitorState::Listening
            | MonitorState::Capturing
            | MonitorState::Unprotecting => true,
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Readiness {
    Pending,
    Armed,
    Failed {
        index: usize,
        stage: RegistrationStage,
        errno: Errno,
    },
}

/// Everything the monitor thread reads or writes, in one private mapping.
struct ControlBlock {
    uffd: i32,
    stop: i32,
    page_size: usize,
    /// Filled before the thread starts, read-only afterwards.
    regions: PrivateVec<RegionEntry>,
    store: UnsafeCell<SnapshotStore>,
    state: AtomicU8,
    readiness: Mutex<Readiness>,
    armed: Condvar,
    faults_in_flight: AtomicUsize,
    faults_handled: AtomicUsize,
}

// The store is written by the monitor thread only while a fault is in flight
// and by the scheduler only after draining.
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn signal(&self, readiness: Readiness) {
        let mut guard = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = readiness;
        self.armed.notify_all();
    }

    /// Init -> Registered -> Armed. On failure, the index of the region and
    /// the operation that failed.
    fn register_all(&self) -> Result<(), (usize, RegistrationStage, Errno)> {
        for (i, entry) in self.regions.iter().enumerate() {
            uffd::register_wp(self.uffd, entry.range)
                .map_err(|e| (i, RegistrationStage::Register, e))?;
        }
        self.set_state(MonitorState::Registered);
        for (i, entry) in self.regions.iter().enumerate() {
            uffd::write_protect(self.uffd, entry.range, true)
                .map_err(|e| (i, RegistrationStage::WriteProtect, e))?;
        }
        Ok(())
    }

    fn fault_loop(&self) {
        let mut fds = [
            libc::pollfd {
                fd: self.uffd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.stop,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            self.set_state(MonitorState::Listening);
            fds[0].revents = 0;
            fds[1].revents = 0;
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                match Errno::last() {
                    Errno::EINTR => continue,
                    errno => monitor_fatal(b"poll", errno),
                }
            }
            if fds[1].revents != 0 {
                break;
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                monitor_fatal(b"poll on userfaultfd", Errno::EIO);
            }
            if fds[0].revents & libc::POLLIN == 0 {
                continue;
            }
            let msg = match uffd::read_msg(self.uffd) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(errno) => monitor_fatal(b"read of fault message", errno),
            };
            let addr = match uffd::wp_fault_address(&msg) {
                Some(addr) => addr,
                None => continue,
            };
            self.faults_in_flight.store(1, Ordering::Release);
            self.set_state(MonitorState::Capturing);
            let page = addr & !(self.page_size - 1);
            let store = unsafe { &mut *self.store.get() };
            if let Err(errno) = unsafe { store.capture(page) } {
                monitor_fatal(b"page capture", errno);
            }
            self.set_state(MonitorState::Unprotecting);
            let range = MemoryRange::new_range(page, self.page_size);
            if let Err(errno) = uffd::write_protect(self.uffd, range, false) {
                monitor_fatal(b"UFFDIO_WRITEPROTECT (clear)", errno);
            }
            self.faults_handled.fetch_add(1, Ordering::Release);
            self.faults_in_flight.store(0, Ordering::Release);
        }
        self.set_state(MonitorState::Stopped);
    }
}

/// Decimal digits of `n`, right-aligned in `digits`.
fn decimal(mut n: u32, digits: &mut [u8; 10]) -> &[u8] {
    let mut d = digits.len();
    loop {
        d -= 1;
        digits[d] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &digits[d..]
}

/// Write "snapbench: protection monitor: <what> failed: errno <n>" to stderr
/// from a stack buffer and abort.
fn monitor_fatal(what: &[u8], errno: Errno) -> ! {
    let mut digits = [0u8; 10];
    let parts: [&[u8]; 5] = [
        b"snapbench: protection monitor: ",
        what,
        b" failed: errno ",
        decimal((errno as i32).unsigned_abs(), &mut digits),
        b"\n",
    ];
    let mut buf = [0u8; 160];
    let mut len = 0;
    for &b in parts.iter().flat_map(|p| p.iter()) {
        if len == buf.len() {
            break;
        }
        buf[len] = b;
        len += 1;
    }
    unsafe {
        libc::write(2, buf.as_ptr() as *const c_void, len);
        libc::abort()
    }
}

extern "C" fn monitor_main(arg: *mut c_void) -> *mut c_void {
    let block = unsafe { &*(arg as *const ControlBlock) };
    match block.register_all() {
        Ok(()) => {
            block.set_state(MonitorState::Armed);
            block.signal(Readiness::Armed);
            block.fault_loop();
        }
        Err((index, stage, errno)) => {
            block.set_state(MonitorState::Failed);
            block.signal(Readiness::Failed {
                index,
                stage,
                errno,
            });
        }
    }
    ptr::null_mut()
}

pub struct ProtectionMonitor {
    uffd: Userfaultfd,
    stop: ScopedFd,
    stack: PrivateMapping,
    block: PrivateBox<ControlBlock>,
    thread: Option<libc::pthread_t>,
    armed: bool,
}

impl ProtectionMonitor {
    /// Allocate the monitor's stack and control block. No thread yet: call
    /// [`ProtectionMonitor::arm`] once the address space is normalized.
    pub fn new(uffd: Userfaultfd, stack_size: usize) -> Result<ProtectionMonitor, HarnessError> {
        let stop = ScopedFd::from_libc_ret(unsafe {
            libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
        })
        .map_err(HarnessError::MonitorThread)?;
        let stack = PrivateMapping::with_guard_page(stack_size).map_err(HarnessError::PrivateMemory)?;
        let ps = page_size();
        let block = PrivateBox::new(ControlBlock {
            uffd: uffd.as_raw(),
            stop: stop.as_raw(),
            page_size: ps,
            regions: PrivateVec::new(),
            store: UnsafeCell::new(SnapshotStore::new(ps)),
            state: AtomicU8::new(MonitorState::Init as u8),
            readiness: Mutex::new(Readiness::Pending),
            armed: Condvar::new(),
            faults_in_flight: AtomicUsize::new(0),
            faults_handled: AtomicUsize::new(0),
        })
        .map_err(HarnessError::PrivateMemory)?;
        Ok(ProtectionMonitor {
            uffd,
            stop,
            stack,
            block,
            thread: None,
            armed: false,
        })
    }

    /// Reserve room for `pages` captures up front.
    pub fn reserve_pages(&mut self, pages: usize) -> Result<(), HarnessError> {
        self.store_mut()
            .reserve(pages)
            .map_err(HarnessError::PrivateMemory)
    }

    /// Private mappings owned by the monitor right now.
    pub fn private_ranges(&self) -> Vec<MemoryRange> {
        let mut ranges = vec![self.stack.range(), self.block.range()];
        ranges.extend(self.block.regions.range());
        ranges.extend(unsafe { &*self.block.store.get() }.ranges());
        ranges
    }

    /// Start the monitor thread, have it register and write protect every
    /// entry of `table`, and wait up to `timeout` for the armed signal.
    pub fn arm(&mut self, table: &[RegionEntry], timeout: Duration) -> Result<(), HarnessError> {
        if self.thread.is_some() {
            return Err(HarnessError::Lifecycle {
                expected: "unarmed",
                actual: "armed",
            });
        }
        self.block
            .regions
            .extend_from_slice(table)
            .map_err(HarnessError::PrivateMemory)?;
        self.spawn()?;

        let guard = self.block.readiness.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .block
            .armed
            .wait_timeout_while(guard, timeout, |r| *r == Readiness::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        let readiness = *guard;
        drop(guard);

        match readiness {
            Readiness::Armed => {
                self.armed = true;
                log!(
                    LogInfo,
                    "armed write protection on {} region(s), {} bytes",
                    table.len(),
                    table.iter().map(|e| e.range.size()).sum::<usize>()
                );
                Ok(())
            }
            Readiness::Failed {
                index,
                stage,
                errno,
            } => {
                self.join();
                Err(HarnessError::Registration {
                    region: table[index].range,
                    stage,
                    errno,
                })
            }
            Readiness::Pending => Err(HarnessError::ArmTimeout(timeout)),
        }
    }

    fn spawn(&mut self) -> Result<(), HarnessError> {
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            let ret = libc::pthread_attr_init(&mut attr);
            if ret != 0 {
                return Err(HarnessError::MonitorThread(Errno::from_raw(ret)));
            }
            let ret = libc::pthread_attr_setstack(
                &mut attr,
                self.stack.as_mut_ptr() as *mut c_void,
                self.stack.len(),
            );
            if ret != 0 {
                libc::pthread_attr_destroy(&mut attr);
                return Err(HarnessError::MonitorThread(Errno::from_raw(ret)));
            }
            let mut tid: libc::pthread_t = mem::zeroed();
            let ret = libc::pthread_create(
                &mut tid,
                &attr,
                monitor_main,
                self.block.as_ptr() as *mut c_void,
            );
            libc::pthread_attr_destroy(&mut attr);
            if ret != 0 {
                return Err(HarnessError::MonitorThread(Errno::from_raw(ret)));
            }
            self.thread = Some(tid);
        }
        Ok(())
    }

    fn join(&mut self) {
        if let Some(tid) = self.thread.take() {
            let one: u64 = 1;
            unsafe {
                libc::write(
                    self.stop.as_raw(),
                    &one as *const u64 as *const c_void,
                    mem::size_of::<u64>(),
                );
                libc::pthread_join(tid, ptr::null_mut());
            }
        }
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.block.state.load(Ordering::Acquire))
    }

    pub fn faults_handled(&self) -> usize {
        self.block.faults_handled.load(Ordering::Acquire)
    }

    pub fn is_user_mode_only(&self) -> bool {
        self.uffd.is_user_mode_only()
    }

    /// Wait until no fault is between "read" and "unprotected". Once the
    /// writer has returned this is only ever a short tail.
    pub fn drain(&self, timeout: Duration) -> Result<(), HarnessError> {
        let start = Instant::now();
        loop {
            let in_flight = self.block.faults_in_flight.load(Ordering::Acquire);
            if in_flight == 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(HarnessError::DrainTimeout { in_flight, timeout });
            }
            std::hint::spin_loop();
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn store_mut(&self) -> &mut SnapshotStore {
        // Callers only get here while no fault is in flight.
        unsafe { &mut *self.block.store.get() }
    }

    /// Pages captured since the last restore. Only meaningful after [`drain`].
    ///
    /// [`drain`]: ProtectionMonitor::drain
    pub fn captured_addresses(&self) -> Vec<usize> {
        self.store_mut().addresses().to_vec()
    }

    /// The bytes captured for `page_addr`. Only meaningful after a drain.
    pub fn captured_page(&self, page_addr: usize) -> Option<Vec<u8>> {
        self.store_mut().get(page_addr).map(|b| b.to_vec())
    }

    /// Write every captured page back, optionally write protect those pages
    /// again, and empty the store. Call only after a successful drain.
    /// Returns the number of captures replayed.
    pub fn restore(&self, rearm: bool) -> Result<usize, HarnessError> {
        let store = self.store_mut();
        let replayed = unsafe { store.replay() };
        if rearm {
            self.rearm_captured(store)?;
        }
        store.clear();
        Ok(replayed)
    }

    /// Accept the current content of every captured page as the new
    /// baseline: write protect them again without replaying.
    pub fn rebaseline(&self, drain_timeout: Duration) -> Result<usize, HarnessError> {
        self.drain(drain_timeout)?;
        let store = self.store_mut();
        let pages = store.len();
        self.rearm_captured(store)?;
        store.clear();
        Ok(pages)
    }

    fn rearm_captured(&self, store: &SnapshotStore) -> Result<(), HarnessError> {
        let ps = self.block.page_size;
        for &page in store.addresses() {
            uffd::write_protect(self.uffd.as_raw(), MemoryRange::new_range(page, ps), true)
                .map_err(|errno| HarnessError::Rearm { page, errno })?;
        }
        Ok(())
    }

    /// Remove write protection from and unregister every region, then stop
    /// and join the thread. Regions are released first so nothing can stall
    /// on a fault nobody answers.
    pub fn teardown(&mut self) -> Result<(), HarnessError> {
        let fd = self.uffd.as_raw();
        let mut first_error = None;
        for entry in self.block.regions.iter() {
            let steps = [
                (
                    RegistrationStage::Unprotect,
                    uffd::write_protect(fd, entry.range, false),
                ),
                (RegistrationStage::Unregister, uffd::unregister(fd, entry.range)),
            ];
            for (stage, result) in steps.iter() {
                if let Err(errno) = result {
                    log!(LogDebug, "{} failed for {} during teardown: {}", stage, entry.range, errno);
                    if self.armed && first_error.is_none() {
                        first_error = Some(HarnessError::Registration {
                            region: entry.range,
                            stage: *stage,
                            errno: *errno,
                        });
                    }
                }
            }
        }
        self.join();
        self.armed = false;
        if self.state() != MonitorState::Failed {
            self.block.set_state(MonitorState::Stopped);
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ProtectionMonitor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.teardown().unwrap_or(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn monitor_or_skip(test: &str) -> Option<ProtectionMonitor> {
        match Userfaultfd::negotiate() {
            Ok(uffd) => Some(ProtectionMonitor::new(uffd, 256 * 1024).unwrap()),
            Err(e) => {
                eprintln!("skipping {}: {}", test, e);
                None
            }
        }
    }

    fn populated(pages: usize, fill: u8) -> PrivateMapping {
        let buf = PrivateMapping::new(pages * page_size()).unwrap();
        unsafe { ptr::write_bytes(buf.as_mut_ptr(), fill, buf.len()) };
        buf
    }

    fn entry(buf: &PrivateMapping) -> RegionEntry {
        RegionEntry {
            range: buf.range(),
            prot: libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    #[test]
    fn stage_display_test() {
        assert_eq!(RegistrationStage::Register.to_string(), "UFFDIO_REGISTER");
        assert_eq!(RegistrationStage::Unregister.to_string(), "UFFDIO_UNREGISTER");
    }

    #[test]
    fn state_round_trip_test() {
        for s in [
            MonitorState::Init,
            MonitorState::Registered,
            MonitorState::Armed,
            MonitorState::Listening,
            MonitorState::Capturing,
            MonitorState::Unprotecting,
            MonitorState::Failed,
            MonitorState::Stopped,
        ]
        .iter()
        {
            assert_eq!(MonitorState::from_u8(*s as u8), *s);
        }
        assert!(MonitorState::Listening.is_armed());
        assert!(!MonitorState::Registered.is_armed());
    }

    #[test]
    fn decimal_test() {
        let mut digits = [0u8; 10];
        assert_eq!(decimal(0, &mut digits), b"0");
        assert_eq!(decimal(12, &mut digits), b"12");
        assert_eq!(decimal(u32::MAX, &mut digits), b"4294967295");
    }

    #[test]
    fn armed_before_any_fault_test() {
        let mut monitor = match monitor_or_skip("armed_before_any_fault_test") {
            Some(m) => m,
            None => return,
        };
        let buf = populated(2, 0);
        monitor.arm(&[entry(&buf)], TIMEOUT).unwrap();
        assert!(monitor.state().is_armed());
        assert_eq!(monitor.faults_handled(), 0);
        assert!(monitor.captured_addresses().is_empty());
        monitor.teardown().unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[test]
    fn capture_first_write_per_page_test() {
        let mut monitor = match monitor_or_skip("capture_first_write_per_page_test") {
            Some(m) => m,
            None => return,
        };
        let ps = page_size();
        let buf = populated(4, 0x11);
        let p = buf.as_mut_ptr();
        monitor.arm(&[entry(&buf)], TIMEOUT).unwrap();

        unsafe {
            ptr::write_volatile(p.add(ps + 10), 0x22);
            ptr::write_volatile(p.add(ps + 20), 0x33);
            ptr::write_volatile(p.add(3 * ps), 0x44);
        }
        monitor.drain(TIMEOUT).unwrap();
        assert_eq!(
            monitor.captured_addresses(),
            vec![p as usize + ps, p as usize + 3 * ps]
        );
        let page = monitor.captured_page(p as usize + ps).unwrap();
        assert!(page.iter().all(|&b| b == 0x11));
        assert_eq!(monitor.faults_handled(), 2);

        assert_eq!(monitor.restore(true).unwrap(), 2);
        unsafe {
            assert_eq!(*p.add(ps + 10), 0x11);
            assert_eq!(*p.add(3 * ps), 0x11);
            // Re-armed: the next write is captured again.
            ptr::write_volatile(p.add(ps), 0x55);
        }
        monitor.drain(TIMEOUT).unwrap();
        assert_eq!(monitor.captured_addresses(), vec![p as usize + ps]);
        monitor.teardown().unwrap();
    }

    #[test]
    fn rebaseline_keeps_current_content_test() {
        let mut monitor = match monitor_or_skip("rebaseline_keeps_current_content_test") {
            Some(m) => m,
            None => return,
        };
        let buf = populated(1, 0);
        let p = buf.as_mut_ptr();
        monitor.arm(&[entry(&buf)], TIMEOUT).unwrap();
        unsafe { ptr::write_volatile(p, 7) };
        assert_eq!(monitor.rebaseline(TIMEOUT).unwrap(), 1);
        unsafe { ptr::write_volatile(p, 8) };
        monitor.drain(TIMEOUT).unwrap();
        monitor.restore(true).unwrap();
        assert_eq!(unsafe { *p }, 7);
        monitor.teardown().unwrap();
    }

    #[test]
    fn registration_failure_names_region_test() {
        let mut monitor = match monitor_or_skip("registration_failure_names_region_test") {
            Some(m) => m,
            None => return,
        };
        let buf = populated(1, 0);
        let bad = RegionEntry {
            range: MemoryRange::new_range(buf.as_mut_ptr() as usize + 1, page_size()),
            prot: libc::PROT_READ | libc::PROT_WRITE,
        };
        match monitor.arm(&[entry(&buf), bad], TIMEOUT) {
            Err(HarnessError::Registration { region, stage, .. }) => {
                assert_eq!(region, bad.range);
                assert_eq!(stage, RegistrationStage::Register);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(monitor.state(), MonitorState::Failed);
        monitor.teardown().unwrap();
    }
}
