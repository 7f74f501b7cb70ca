//! Harness-private memory.
//!
//! Mappings made directly through the raw syscall gateway, never through the
//! allocator. They are excluded from the monitored set, so writes to them never
//! fault and restore never touches them. The monitor thread writes nothing
//! else once tracking is armed, and the scheduler writes nothing else inside
//! the iteration loop.

use crate::{address_space::memory_range::MemoryRange, raw_syscalls, util::ceil_page_size};
use libc::c_void;
use nix::errno::Errno;
use std::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr, slice,
};

/// An owned anonymous read/write mapping, optionally with an inaccessible
/// guard page below it.
#[derive(Debug)]
pub struct PrivateMapping {
    base: *mut u8,
    total_len: usize,
    guard_len: usize,
}

// The mapping is plain memory owned by exactly one PrivateMapping.
unsafe impl Send for PrivateMapping {}

impl PrivateMapping {
    pub fn new(len: usize) -> Result<PrivateMapping, Errno> {
        let total_len = ceil_page_size(len.max(1));
        let base = unsafe { raw_syscalls::map_anonymous(total_len)? } as *mut u8;
        Ok(PrivateMapping {
            base,
            total_len,
            guard_len: 0,
        })
    }

    /// A mapping whose lowest page is `PROT_NONE`, for use as a downward
    /// growing stack.
    pub fn with_guard_page(len: usize) -> Result<PrivateMapping, Errno> {
        let guard_len = ceil_page_size(1usize);
        let total_len = ceil_page_size(len.max(1)) + guard_len;
        let base = unsafe { raw_syscalls::map_anonymous(total_len)? };
        if let Err(e) = unsafe { raw_syscalls::mprotect(base, guard_len, libc::PROT_NONE) } {
            unsafe { raw_syscalls::munmap(base, total_len).unwrap_or(()) };
            return Err(e);
        }
        Ok(PrivateMapping {
            base: base as *mut u8,
            total_len,
            guard_len,
        })
    }

    /// Start of the usable (non-guard) part.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard_len) }
    }

    /// Size of the usable part.
    pub fn len(&self) -> usize {
        self.total_len - self.guard_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest usable byte, i.e. the initial stack pointer for a stack.
    pub fn top(&self) -> usize {
        self.base as usize + self.total_len
    }

    /// The whole mapping including any guard page.
    pub fn range(&self) -> MemoryRange {
        MemoryRange::new_range(self.base as usize, self.total_len)
    }
}

impl Drop for PrivateMapping {
    fn drop(&mut self) {
        // Nothing sensible to do if munmap fails on a mapping we own.
        unsafe {
            raw_syscalls::munmap(self.base as *mut c_void, self.total_len).unwrap_or(());
        }
    }
}

/// A growable array of `Copy` values in harness-private memory.
///
/// Growth strategy: capacity doubles, rounded up to whole pages; a new mapping
/// is made, the live elements are copied over and the old mapping is released.
/// The first allocation holds at least one page worth of elements.
pub struct PrivateVec<T: Copy> {
    mapping: Option<PrivateMapping>,
    len: usize,
    cap: usize,
    phantom: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for PrivateVec<T> {}

impl<T: Copy> PrivateVec<T> {
    pub fn new() -> PrivateVec<T> {
        debug_assert!(size_of::<T>() > 0);
        debug_assert!(align_of::<T>() <= ceil_page_size(1usize));
        PrivateVec {
            mapping: None,
            len: 0,
            cap: 0,
            phantom: PhantomData,
        }
    }

    pub fn with_capacity(cap: usize) -> Result<PrivateVec<T>, Errno> {
        let mut v = PrivateVec::new();
        v.reserve(cap)?;
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// The current backing mapping, if any.
    pub fn range(&self) -> Option<MemoryRange> {
        self.mapping.as_ref().map(|m| m.range())
    }

    /// Capacity that `grow` would move to from `cap` when `needed` slots are required.
    fn next_capacity(cap: usize, needed: usize) -> usize {
        let per_page = ceil_page_size(1usize) / size_of::<T>();
        let mut new_cap = cap.max(per_page.max(1));
        while new_cap < needed {
            new_cap *= 2;
        }
        // Use the whole last page.
        ceil_page_size(new_cap * size_of::<T>()) / size_of::<T>()
    }

    pub fn reserve(&mut self, additional: usize) -> Result<(), Errno> {
        let needed = self.len + additional;
        if needed <= self.cap {
            return Ok(());
        }
        let new_cap = Self::next_capacity(self.cap * 2, needed);
        let new_mapping = PrivateMapping::new(new_cap * size_of::<T>())?;
        if let Some(old) = &self.mapping {
            unsafe {
                ptr::copy_nonoverlapping(
                    old.as_mut_ptr() as *const T,
                    new_mapping.as_mut_ptr() as *mut T,
                    self.len,
                );
            }
        }
        // Dropping the old mapping unmaps it.
        self.mapping = Some(new_mapping);
        self.cap = new_cap;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> Result<(), Errno> {
        if self.len == self.cap {
            self.reserve(1)?;
        }
        unsafe { ptr::write(self.ptr().add(self.len), value) };
        self.len += 1;
        Ok(())
    }

    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<(), Errno> {
        self.reserve(values.len())?;
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.ptr().add(self.len), values.len());
        }
        self.len += values.len();
        Ok(())
    }

    /// Forget all elements but keep the mapping.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.mapping {
            Some(_) => unsafe { slice::from_raw_parts(self.ptr(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &self.mapping {
            Some(_) => unsafe { slice::from_raw_parts_mut(self.ptr(), self.len) },
            None => &mut [],
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    fn ptr(&self) -> *mut T {
        match &self.mapping {
            Some(m) => m.as_mut_ptr() as *mut T,
            None => ptr::NonNull::dangling().as_ptr(),
        }
    }
}

impl<T: Copy> Default for PrivateVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Deref for PrivateVec<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy> DerefMut for PrivateVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

/// A single value placed in its own private mapping.
pub struct PrivateBox<T> {
    mapping: PrivateMapping,
    phantom: PhantomData<T>,
}

unsafe impl<T: Send> Send for PrivateBox<T> {}
unsafe impl<T: Sync> Sync for PrivateBox<T> {}

impl<T> PrivateBox<T> {
    pub fn new(value: T) -> Result<PrivateBox<T>, Errno> {
        debug_assert!(align_of::<T>() <= ceil_page_size(1usize));
        let mapping = PrivateMapping::new(size_of::<T>())?;
        unsafe { ptr::write(mapping.as_mut_ptr() as *mut T, value) };
        Ok(PrivateBox {
            mapping,
            phantom: PhantomData,
        })
    }

    pub fn as_ptr(&self) -> *const T {
        self.mapping.as_mut_ptr() as *const T
    }

    pub fn range(&self) -> MemoryRange {
        self.mapping.range()
    }
}

impl<T> Deref for PrivateBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.as_ptr() }
    }
}

impl<T> DerefMut for PrivateBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *(self.mapping.as_mut_ptr() as *mut T) }
    }
}

impl<T> Drop for PrivateBox<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.mapping.as_mut_ptr() as *mut T) };
    }
}
