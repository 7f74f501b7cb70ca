#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

//! Layouts and request numbers from `linux/userfaultfd.h`.

use std::mem::size_of;

pub const UFFD_API: u64 = 0xAA;
pub const UFFDIO: u8 = 0xAA;

/// Flag for the userfaultfd(2) syscall: only handle faults from user mode.
/// Allowed for unprivileged users even when `vm.unprivileged_userfaultfd` is 0.
pub const UFFD_USER_MODE_ONLY: i32 = 1;

pub const _UFFDIO_REGISTER: u8 = 0x00;
pub const _UFFDIO_UNREGISTER: u8 = 0x01;
pub const _UFFDIO_WRITEPROTECT: u8 = 0x06;
pub const _UFFDIO_API: u8 = 0x3F;

pub const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;

pub const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;

pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;

pub const UFFD_PAGEFAULT_FLAG_WRITE: u64 = 1 << 0;
pub const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 1;

bitflags! {
    /// `uffdio_api.features`
    pub struct UffdFeatures: u64 {
        const PAGEFAULT_FLAG_WP = 1 << 0;
        const EVENT_FORK = 1 << 1;
        const EVENT_REMAP = 1 << 2;
        const EVENT_REMOVE = 1 << 3;
        const MISSING_HUGETLBFS = 1 << 4;
        const MISSING_SHMEM = 1 << 5;
        const EVENT_UNMAP = 1 << 6;
        const SIGBUS = 1 << 7;
        const THREAD_ID = 1 << 8;
        const MINOR_HUGETLBFS = 1 << 9;
        const MINOR_SHMEM = 1 << 10;
        const EXACT_ADDRESS = 1 << 11;
        const WP_HUGETLBFS_SHMEM = 1 << 12;
        const WP_UNPOPULATED = 1 << 13;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct uffdio_api {
    pub api: u64,
    pub features: u64,
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct uffdio_range {
    pub start: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct uffdio_register {
    pub range: uffdio_range,
    pub mode: u64,
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct uffdio_writeprotect {
    pub range: uffdio_range,
    pub mode: u64,
}

/// The `pagefault` arm of the `uffd_msg.arg` union. The other arms are for
/// events this crate never requests and have the same size.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct uffd_pagefault {
    pub flags: u64,
    pub address: u64,
    pub ptid: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct uffd_msg {
    pub event: u8,
    pub reserved1: u8,
    pub reserved2: u16,
    pub reserved3: u32,
    pub arg: uffd_pagefault,
}

assert_eq_size!(uffdio_api, [u8; 24]);
assert_eq_size!(uffdio_range, [u8; 16]);
assert_eq_size!(uffdio_register, [u8; 32]);
assert_eq_size!(uffdio_writeprotect, [u8; 24]);
assert_eq_size!(uffd_msg, [u8; 32]);

pub const UFFD_MSG_SIZE: usize = size_of::<uffd_msg>();

nix::ioctl_readwrite!(uffdio_api_ioctl, UFFDIO, _UFFDIO_API, uffdio_api);
nix::ioctl_readwrite!(uffdio_register_ioctl, UFFDIO, _UFFDIO_REGISTER, uffdio_register);
nix::ioctl_read!(uffdio_unregister_ioctl, UFFDIO, _UFFDIO_UNREGISTER, uffdio_range);
nix::ioctl_readwrite!(
    uffdio_writeprotect_ioctl,
    UFFDIO,
    _UFFDIO_WRITEPROTECT,
    uffdio_writeprotect
);

/// Bit in `uffdio_register.ioctls` saying the range supports UFFDIO_WRITEPROTECT.
pub const UFFDIO_WRITEPROTECT_SUPPORTED: u64 = 1 << _UFFDIO_WRITEPROTECT;
