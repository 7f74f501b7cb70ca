//! A negotiated userfaultfd descriptor in write-protect mode.

use crate::{
    address_space::memory_range::MemoryRange,
    bindings::userfaultfd::*,
    error::HarnessError,
    log::{LogDebug, LogInfo, LogWarn},
    scoped_fd::ScopedFd,
};
use libc::c_void;
use nix::errno::Errno;
use std::os::unix::io::RawFd;

pub struct Userfaultfd {
    fd: ScopedFd,
    features: UffdFeatures,
    user_mode_only: bool,
}

fn open_raw(flags: i32) -> Result<ScopedFd, Errno> {
    let ret = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
    ScopedFd::from_libc_ret(ret as RawFd)
}

/// Open a descriptor, falling back to user-mode-only handling when the
/// system forbids unprivileged kernel-fault handling.
fn open_descriptor() -> Result<(ScopedFd, bool), HarnessError> {
    let flags = libc::O_CLOEXEC | libc::O_NONBLOCK;
    match open_raw(flags) {
        Ok(fd) => Ok((fd, false)),
        Err(Errno::EPERM) => match open_raw(flags | UFFD_USER_MODE_ONLY) {
            Ok(fd) => Ok((fd, true)),
            Err(errno) => Err(HarnessError::Negotiation {
                stage: "userfaultfd(UFFD_USER_MODE_ONLY)",
                errno,
            }),
        },
        Err(Errno::ENOSYS) => Err(HarnessError::Unsupported(
            "kernel was built without userfaultfd".into(),
        )),
        Err(errno) => Err(HarnessError::Negotiation {
            stage: "userfaultfd",
            errno,
        }),
    }
}

fn handshake(fd: &ScopedFd, requested: UffdFeatures) -> Result<UffdFeatures, Errno> {
    let mut api = uffdio_api {
        api: UFFD_API,
        features: requested.bits(),
        ioctls: 0,
    };
    unsafe { uffdio_api_ioctl(fd.as_raw(), &mut api)? };
    Ok(UffdFeatures::from_bits_truncate(api.features))
}

/// The features the running kernel offers. Uses a throwaway descriptor:
/// UFFDIO_API may only succeed once per descriptor.
pub fn probe_features() -> Result<UffdFeatures, HarnessError> {
    let (fd, _) = open_descriptor()?;
    handshake(&fd, UffdFeatures::empty()).map_err(|errno| HarnessError::Negotiation {
        stage: "UFFDIO_API (probe)",
        errno,
    })
}

impl Userfaultfd {
    /// Open and handshake a descriptor with write-protect faults enabled.
    pub fn negotiate() -> Result<Userfaultfd, HarnessError> {
        let available = probe_features()?;
        log!(LogDebug, "userfaultfd features offered: {:?}", available);
        if !available.contains(UffdFeatures::PAGEFAULT_FLAG_WP) {
            return Err(HarnessError::Unsupported(
                "kernel does not offer UFFD_FEATURE_PAGEFAULT_FLAG_WP".into(),
            ));
        }
        let requested =
            UffdFeatures::PAGEFAULT_FLAG_WP | (available & UffdFeatures::WP_UNPOPULATED);

        let (fd, user_mode_only) = open_descriptor()?;
        let features = handshake(&fd, requested).map_err(|errno| HarnessError::Negotiation {
            stage: "UFFDIO_API",
            errno,
        })?;
        if user_mode_only {
            log!(
                LogWarn,
                "userfaultfd limited to user-mode faults: kernel writes into monitored memory will fail with EFAULT"
            );
        }
        log!(LogInfo, "userfaultfd negotiated: {:?}", features);
        Ok(Userfaultfd {
            fd,
            features,
            user_mode_only,
        })
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd.as_raw()
    }

    pub fn features(&self) -> UffdFeatures {
        self.features
    }

    pub fn is_user_mode_only(&self) -> bool {
        self.user_mode_only
    }
}

fn uffd_range(range: MemoryRange) -> uffdio_range {
    uffdio_range {
        start: range.start() as u64,
        len: range.size() as u64,
    }
}

/// Register `range` for write-protect faults. Fails with `EOPNOTSUPP` if the
/// kernel accepts the registration but cannot write protect the range.
pub fn register_wp(fd: RawFd, range: MemoryRange) -> Result<(), Errno> {
    let mut reg = uffdio_register {
        range: uffd_range(range),
        mode: UFFDIO_REGISTER_MODE_WP,
        ioctls: 0,
    };
    unsafe { uffdio_register_ioctl(fd, &mut reg)? };
    if reg.ioctls & UFFDIO_WRITEPROTECT_SUPPORTED == 0 {
        return Err(Errno::EOPNOTSUPP);
    }
    Ok(())
}

/// Set (`protect == true`) or clear write protection. Clearing wakes any
/// thread stalled on a write into the range.
pub fn write_protect(fd: RawFd, range: MemoryRange, protect: bool) -> Result<(), Errno> {
    let mut wp = uffdio_writeprotect {
        range: uffd_range(range),
        mode: if protect {
            UFFDIO_WRITEPROTECT_MODE_WP
        } else {
            0
        },
    };
    unsafe { uffdio_writeprotect_ioctl(fd, &mut wp)? };
    Ok(())
}

pub fn unregister(fd: RawFd, range: MemoryRange) -> Result<(), Errno> {
    let mut r = uffd_range(range);
    unsafe { uffdio_unregister_ioctl(fd, &mut r)? };
    Ok(())
}

/// Read one message. `Ok(None)` when nothing is pending.
pub fn read_msg(fd: RawFd) -> Result<Option<uffd_msg>, Errno> {
    let mut msg = uffd_msg::default();
    let ret = unsafe { libc::read(fd, &mut msg as *mut uffd_msg as *mut c_void, UFFD_MSG_SIZE) };
    if ret < 0 {
        return match Errno::last() {
            Errno::EAGAIN | Errno::EINTR => Ok(None),
            errno => Err(errno),
        };
    }
    if ret as usize != UFFD_MSG_SIZE {
        return Err(Errno::EIO);
    }
    Ok(Some(msg))
}

/// `Some(faulting address)` if `msg` is a write-protect fault.
pub fn wp_fault_address(msg: &uffd_msg) -> Option<usize> {
    if msg.event == UFFD_EVENT_PAGEFAULT && msg.arg.flags & UFFD_PAGEFAULT_FLAG_WP != 0 {
        Some(msg.arg.address as usize)
    } else {
        None
    }
}
