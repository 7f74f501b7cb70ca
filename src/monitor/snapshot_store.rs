use crate::{address_space::memory_range::MemoryRange, private_mem::PrivateVec};
use nix::errno::Errno;
use std::{ptr, slice};

/// Pages captured on their first write, with the bytes they held just
/// before that write.
///
/// Page `i` is `addrs[i]`, its bytes are `data[i * page_size..(i + 1) * page_size]`.
/// Written only by the monitor thread, read and cleared only by the scheduler
/// once the fault loop has drained.
pub struct SnapshotStore {
    page_size: usize,
    addrs: PrivateVec<usize>,
    data: PrivateVec<u8>,
}

impl SnapshotStore {
    pub fn new(page_size: usize) -> SnapshotStore {
        SnapshotStore {
            page_size,
            addrs: PrivateVec::new(),
            data: PrivateVec::new(),
        }
    }

    /// Reserve room for `pages` captures so the fault loop doesn't have to
    /// grow the tables on the first iterations.
    pub fn reserve(&mut self, pages: usize) -> Result<(), Errno> {
        self.addrs.reserve(pages)?;
        self.data.reserve(pages * self.page_size)
    }

    /// Copy the current content of the page at `page_addr`.
    ///
    /// # Safety
    /// `page_addr` must be page aligned and the whole page readable.
    pub unsafe fn capture(&mut self, page_addr: usize) -> Result<(), Errno> {
        debug_assert_eq!(page_addr % self.page_size, 0);
        let bytes = slice::from_raw_parts(page_addr as *const u8, self.page_size);
        // Grow both tables before touching either so a failure leaves them consistent.
        self.data.reserve(self.page_size)?;
        self.addrs.reserve(1)?;
        self.data.extend_from_slice(bytes)?;
        self.addrs.push(page_addr)
    }

    /// Write every captured page back to its address, newest first, so that
    /// when a page was captured more than once its earliest content wins.
    /// Returns the number of captures replayed.
    ///
    /// # Safety
    /// Every captured page must still be mapped and writable.
    pub unsafe fn replay(&self) -> usize {
        for i in (0..self.addrs.len()).rev() {
            ptr::copy_nonoverlapping(
                self.data.as_ptr().add(i * self.page_size),
                self.addrs[i] as *mut u8,
                self.page_size,
            );
        }
        self.addrs.len()
    }

    /// The content captured for `page_addr`, earliest capture first.
    pub fn get(&self, page_addr: usize) -> Option<&[u8]> {
        self.addrs
            .iter()
            .position(|&a| a == page_addr)
            .map(|i| &self.data[i * self.page_size..(i + 1) * self.page_size])
    }

    /// Addresses in capture order. May contain duplicates.
    pub fn addresses(&self) -> &[usize] {
        self.addrs.as_slice()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn clear(&mut self) {
        self.addrs.clear();
        self.data.clear();
    }

    /// Mappings currently backing the store.
    pub fn ranges(&self) -> Vec<MemoryRange> {
        self.addrs.range().into_iter().chain(self.data.range()).collect()
    }
}
