use super::memory_range::MemoryRange;
use crate::util::page_size;
use libc::{c_int, dev_t, ino_t};
use nix::sys::{
    mman::ProtFlags,
    stat::{major, minor},
};
use std::{
    fmt::{Display, Formatter, Result},
    ops::Deref,
    path::PathBuf,
};

pub const NO_DEVICE: dev_t = 0;
pub const NO_INODE: ino_t = 0;

/// Kernel-provided mappings that are not real memory and can never be
/// remapped or write protected.
const PSEUDO_MAPPINGS: &[&str] = &[
    "[vsyscall]",
    "[vvar]",
    "[vvar_vclock]",
    "[vdso]",
    "[uprobes]",
];

/// What backs a region, as per the last column of /proc/<pid>/maps.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Backing {
    Anonymous,
    File(PathBuf),
    /// A bracketed kernel name like `[heap]`, `[stack]` or `[vdso]`.
    Pseudo(String),
}

impl Backing {
    pub fn from_fsname(fsname: &str) -> Backing {
        if fsname.is_empty() {
            Backing::Anonymous
        } else if fsname.starts_with('[') && fsname.ends_with(']') {
            Backing::Pseudo(fsname.to_owned())
        } else {
            Backing::File(PathBuf::from(fsname))
        }
    }
}

impl Display for Backing {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Backing::Anonymous => Ok(()),
            Backing::File(path) => write!(f, "{}", path.display()),
            Backing::Pseudo(name) => write!(f, "{}", name),
        }
    }
}

/// The part of a region the normalizer and the monitor need. `Copy` so it
/// can live in harness-private memory.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RegionEntry {
    pub range: MemoryRange,
    pub prot: c_int,
}

impl RegionEntry {
    pub fn prot_flags(&self) -> ProtFlags {
        ProtFlags::from_bits_truncate(self.prot)
    }
}

/// One virtual memory area of this process.
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    mr: MemoryRange,
    prot_: ProtFlags,
    private_: bool,
    offset: u64,
    device_: dev_t,
    inode_: ino_t,
    backing_: Backing,
}

impl MemoryRegion {
    pub fn new_with_opts(
        start: usize,
        end: usize,
        backing: Backing,
        device: dev_t,
        inode: ino_t,
        prot: ProtFlags,
        private: bool,
        offset: u64,
    ) -> MemoryRegion {
        let result = MemoryRegion {
            mr: MemoryRange::from_range(start, end),
            prot_: prot,
            private_: private,
            offset,
            device_: device,
            inode_: inode,
            backing_: backing,
        };
        result.assert_valid();
        result
    }

    /// An anonymous private region, the shape everything has after normalization.
    pub fn anonymous(range: MemoryRange, prot: ProtFlags) -> MemoryRegion {
        MemoryRegion::new_with_opts(
            range.start(),
            range.end(),
            Backing::Anonymous,
            NO_DEVICE,
            NO_INODE,
            prot,
            true,
            0,
        )
    }

    pub fn assert_valid(&self) {
        debug_assert!(self.end() >= self.start());
        debug_assert!(self.size() % page_size() == 0);
        debug_assert!(self.offset % page_size() as u64 == 0);
    }

    /// The same region restricted to `sub`, which must lie inside it.
    pub fn subrange(&self, sub: MemoryRange) -> MemoryRegion {
        debug_assert!(self.mr.contains(&sub));
        let delta = if self.is_real_device() {
            (sub.start() - self.start()) as u64
        } else {
            0
        };
        MemoryRegion::new_with_opts(
            sub.start(),
            sub.end(),
            self.backing_.clone(),
            self.device_,
            self.inode_,
            self.prot_,
            self.private_,
            self.offset + delta,
        )
    }

    pub fn range(&self) -> MemoryRange {
        self.mr
    }
    pub fn prot(&self) -> ProtFlags {
        self.prot_
    }
    pub fn backing(&self) -> &Backing {
        &self.backing_
    }
    pub fn device(&self) -> dev_t {
        self.device_
    }
    pub fn inode(&self) -> ino_t {
        self.inode_
    }
    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    pub fn is_readable(&self) -> bool {
        self.prot_.contains(ProtFlags::PROT_READ)
    }
    pub fn is_writable(&self) -> bool {
        self.prot_.contains(ProtFlags::PROT_WRITE)
    }
    pub fn is_executable(&self) -> bool {
        self.prot_.contains(ProtFlags::PROT_EXEC)
    }
    pub fn is_private(&self) -> bool {
        self.private_
    }
    /// `---p` areas: guard pages and reserved address space.
    pub fn has_no_access(&self) -> bool {
        !(self.is_readable() || self.is_writable() || self.is_executable())
    }

    /// Return true if this file is/was backed by an external
    /// device, as opposed to a transient RAM mapping.
    pub fn is_real_device(&self) -> bool {
        self.device() > NO_DEVICE
    }
    pub fn is_anonymous(&self) -> bool {
        self.backing_ == Backing::Anonymous
    }
    pub fn is_pseudo_mapping(&self) -> bool {
        match &self.backing_ {
            Backing::Pseudo(name) => PSEUDO_MAPPINGS.contains(&name.as_str()),
            _ => false,
        }
    }
    pub fn is_heap(&self) -> bool {
        self.backing_ == Backing::Pseudo("[heap]".into())
    }
    pub fn is_stack(&self) -> bool {
        matches!(&self.backing_, Backing::Pseudo(name) if name.starts_with("[stack"))
    }

    pub fn entry(&self) -> RegionEntry {
        RegionEntry {
            range: self.mr,
            prot: self.prot_.bits(),
        }
    }

    /// Dump a representation of |self| to a string in a format
    /// similar to /proc/[pid]/maps.
    pub fn str(&self) -> String {
        let map_shared = if self.private_ { 'p' } else { 's' };
        let s = format!(
            "{:8x}-{:8x} {}{} {:08x} {:02x}:{:02x} {:<10} ",
            self.start(),
            self.end(),
            self.prot_string(),
            map_shared,
            self.offset,
            major(self.device()),
            minor(self.device()),
            self.inode()
        );
        s + &self.backing_.to_string()
    }

    fn prot_string(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.is_readable() { 'r' } else { '-' });
        s.push(if self.is_writable() { 'w' } else { '-' });
        s.push(if self.is_executable() { 'x' } else { '-' });
        s
    }
}

impl Deref for MemoryRegion {
    type Target = MemoryRange;
    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

impl Display for MemoryRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(fsname: &str, prot: ProtFlags) -> MemoryRegion {
        let ps = page_size();
        MemoryRegion::new_with_opts(
            ps,
            3 * ps,
            Backing::from_fsname(fsname),
            NO_DEVICE,
            NO_INODE,
            prot,
            true,
            0,
        )
    }

    #[test]
    fn backing_test() {
        assert_eq!(Backing::from_fsname(""), Backing::Anonymous);
        assert_eq!(
            Backing::from_fsname("[heap]"),
            Backing::Pseudo("[heap]".into())
        );
        assert_eq!(
            Backing::from_fsname("/usr/lib/libc.so.6"),
            Backing::File(PathBuf::from("/usr/lib/libc.so.6"))
        );
    }

    #[test]
    fn pseudo_mapping_test() {
        let rx = ProtFlags::PROT_READ | ProtFlags::PROT_EXEC;
        assert!(region("[vdso]", rx).is_pseudo_mapping());
        assert!(region("[vvar]", ProtFlags::PROT_READ).is_pseudo_mapping());
        assert!(region("[vsyscall]", ProtFlags::PROT_EXEC).is_pseudo_mapping());
        assert!(!region("[heap]", ProtFlags::PROT_READ).is_pseudo_mapping());
        assert!(region("[heap]", ProtFlags::PROT_READ).is_heap());
        assert!(region("[stack]", ProtFlags::PROT_READ).is_stack());
        assert!(!region("", ProtFlags::PROT_READ).is_pseudo_mapping());
    }

    #[test]
    fn no_access_test() {
        assert!(region("", ProtFlags::PROT_NONE).has_no_access());
        assert!(!region("", ProtFlags::PROT_EXEC).has_no_access());
    }

    #[test]
    fn subrange_keeps_file_offset_in_step_test() {
        let ps = page_size();
        let r = MemoryRegion::new_with_opts(
            ps,
            4 * ps,
            Backing::from_fsname("/bin/true"),
            0x801,
            42,
            ProtFlags::PROT_READ,
            true,
            ps as u64,
        );
        let sub = r.subrange(MemoryRange::from_range(2 * ps, 3 * ps));
        assert_eq!(sub.file_offset_bytes(), 2 * ps as u64);
        assert_eq!(sub.size(), ps);
        assert_eq!(sub.inode(), 42);
    }

    #[test]
    fn entry_carries_prot_test() {
        let r = region("", ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        let e = r.entry();
        assert_eq!(e.range, r.range());
        assert_eq!(e.prot, libc::PROT_READ | libc::PROT_WRITE);
    }

    #[test]
    fn str_test() {
        let r = region("[heap]", ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        let s = r.str();
        assert!(s.contains("rw-p"));
        assert!(s.ends_with("[heap]"));
    }
}
