//! Address space normalization.
//!
//! Every monitored region is turned into an anonymous private mapping at the
//! same address, with the same bytes and the original protection. File-backed
//! and shared mappings cannot all be write protected through userfaultfd,
//! anonymous private memory always can.
//!
//! The fresh mapping replaces the original with a single `MAP_FIXED` mmap, so
//! the range is never unmapped and no other thread's mapping can land in it.
//! Between that mmap and copying the bytes back the region holds zeros. The
//! code running in that window touches only its own stack, the harness's own
//! text, the private region table and the scratch mapping: no libc, no
//! allocator, no logging.

pub mod memory_range;
pub mod memory_region;
pub mod region_catalog;

use crate::{
    error::HarnessError,
    private_mem::PrivateVec,
    raw_syscalls,
};
use libc::c_void;
use memory_region::{MemoryRegion, RegionEntry};
use nix::errno::Errno;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    mem::size_of,
    ptr::{read_volatile, write_volatile},
};

/// The step of the per-region conversion that failed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NormalizeStep {
    MakeReadable,
    MapScratch,
    MapFixed,
    UnmapScratch,
    Reprotect,
}

impl Display for NormalizeStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            NormalizeStep::MakeReadable => "add read permission",
            NormalizeStep::MapScratch => "map scratch copy",
            NormalizeStep::MapFixed => "map anonymous memory over the original",
            NormalizeStep::UnmapScratch => "release scratch copy",
            NormalizeStep::Reprotect => "reapply original protection",
        };
        f.write_str(s)
    }
}

/// Which entry failed and how. `Copy`, so reporting it allocates nothing.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct NormalizeFailure {
    pub index: usize,
    pub step: NormalizeStep,
    pub errno: Errno,
}

/// Copy `len` bytes word by word. Volatile so the compiler cannot turn the
/// loop into a call to libc's `memcpy`.
#[inline(always)]
unsafe fn copy_words(src: *const u8, dst: *mut u8, len: usize) {
    debug_assert!(len % size_of::<usize>() == 0);
    let src = src as *const usize;
    let dst = dst as *mut usize;
    for i in 0..len / size_of::<usize>() {
        write_volatile(dst.add(i), read_volatile(src.add(i)));
    }
}

/// Convert one region in place.
///
/// # Safety
/// Nothing the caller is executing or referencing may live in `entry.range`.
#[inline(never)]
pub unsafe fn normalize_entry(entry: &RegionEntry) -> Result<(), (NormalizeStep, Errno)> {
    let start = entry.range.start() as *mut c_void;
    let len = entry.range.size();

    if entry.prot & libc::PROT_READ == 0 {
        raw_syscalls::mprotect(start, len, entry.prot | libc::PROT_READ)
            .map_err(|e| (NormalizeStep::MakeReadable, e))?;
    }

    let scratch =
        raw_syscalls::map_anonymous(len).map_err(|e| (NormalizeStep::MapScratch, e))?;
    copy_words(start as *const u8, scratch as *mut u8, len);

    // Replaces the original atomically; zeros until the copy back completes.
    let fresh = raw_syscalls::map_anonymous_fixed(start, len)
        .map_err(|e| (NormalizeStep::MapFixed, e))?;
    copy_words(scratch as *const u8, fresh as *mut u8, len);

    raw_syscalls::munmap(scratch, len).map_err(|e| (NormalizeStep::UnmapScratch, e))?;
    raw_syscalls::mprotect(start, len, entry.prot).map_err(|e| (NormalizeStep::Reprotect, e))
}

/// Convert every entry, stopping at the first failure.
///
/// # Safety
/// See [`normalize_entry`]; `entries` itself must be harness-private.
#[inline(never)]
pub unsafe fn normalize_entries(entries: &[RegionEntry]) -> Result<(), NormalizeFailure> {
    for (index, entry) in entries.iter().enumerate() {
        if let Err((step, errno)) = normalize_entry(entry) {
            return Err(NormalizeFailure { index, step, errno });
        }
    }
    Ok(())
}

/// An address inside the text the normalizer executes. The region containing
/// it must never be normalized.
pub fn normalizer_code_address() -> usize {
    normalize_entry as *const () as usize
}

/// Drives [`normalize_entries`] over a region table and turns failures into
/// descriptive errors once it is safe to allocate again.
pub struct AddressSpaceNormalizer;

impl AddressSpaceNormalizer {
    /// `table[i]` must be `regions[i].entry()`.
    pub fn normalize(
        table: &PrivateVec<RegionEntry>,
        regions: &[MemoryRegion],
    ) -> Result<(), HarnessError> {
        debug_assert_eq!(table.len(), regions.len());
        let result = unsafe { normalize_entries(table.as_slice()) };
        match result {
            Ok(()) => {
                log!(
                    crate::log::LogInfo,
                    "normalized {} region(s), {} bytes",
                    table.len(),
                    table.iter().map(|e| e.range.size()).sum::<usize>()
                );
                Ok(())
            }
            Err(failure) => Err(HarnessError::Normalization {
                region: regions
                    .get(failure.index)
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| table[failure.index].range.to_string()),
                step: failure.step,
                errno: failure.errno,
            }),
        }
    }
}
