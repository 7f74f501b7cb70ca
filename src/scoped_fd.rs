use nix::{errno::Errno, unistd::close};
use std::os::unix::io::RawFd;

// We DON'T want this to be Copy or Clone because of the Drop.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    /// Wrap the result of a raw libc call that returns a descriptor or -1.
    pub fn from_libc_ret(ret: RawFd) -> Result<Self, Errno> {
        if ret < 0 {
            Err(Errno::last())
        } else {
            Ok(ScopedFd { fd: ret })
        }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }
        self.fd = -1;
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}
