//! Raw definitions of the linux `sync_file` and `sw_sync` kernel interfaces.
//!
//! Mirrors `include/uapi/linux/sync_file.h` and the private `sw_sync`
//! definitions from `drivers/dma-buf/sw_sync.c`.
#![allow(non_camel_case_types)]

extern crate libc;

use libc::{c_char, c_ulong};
use std::mem::size_of;

/// Device node exposed by kernels built with `CONFIG_SW_SYNC` and devtmpfs.
pub const DEVFS_SW_SYNC: &str = "/dev/sw_sync";
/// Fallback debugfs node used by older kernels.
pub const DEBUGFS_SW_SYNC: &str = "/sys/kernel/debug/sync/sw_sync";

/// Length of every name field in the sync ABI, including the nul terminator.
pub const SYNC_NAME_LEN: usize = 32;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sw_sync_create_fence_data {
    pub value: u32,
    pub name: [c_char; SYNC_NAME_LEN],
    pub fence: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sync_merge_data {
    pub name: [c_char; SYNC_NAME_LEN],
    pub fd2: i32,
    pub fence: i32,
    pub flags: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sync_fence_info {
    pub obj_name: [c_char; SYNC_NAME_LEN],
    pub driver_name: [c_char; SYNC_NAME_LEN],
    pub status: i32,
    pub flags: u32,
    pub timestamp_ns: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sync_file_info {
    pub name: [c_char; SYNC_NAME_LEN],
    pub status: i32,
    pub flags: u32,
    pub num_fences: u32,
    pub pad: u32,
    pub sync_fence_info: u64,
}

#[cfg(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "sparc",
    target_arch = "sparc64"
))]
mod ioc {
    pub const SIZEBITS: u32 = 13;
    pub const WRITE: u32 = 4;
    pub const READ: u32 = 2;
}

#[cfg(not(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "sparc",
    target_arch = "sparc64"
)))]
mod ioc {
    pub const SIZEBITS: u32 = 14;
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
}

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + ioc::SIZEBITS;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> c_ulong {
    ((dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as c_ulong
}

const fn iow<T>(ty: u8, nr: u8) -> c_ulong {
    ioc(ioc::WRITE, ty, nr, size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u8) -> c_ulong {
    ioc(ioc::READ | ioc::WRITE, ty, nr, size_of::<T>())
}

pub const SW_SYNC_IOC_MAGIC: u8 = b'W';
pub const SW_SYNC_IOC_CREATE_FENCE: c_ulong =
    iowr::<sw_sync_create_fence_data>(SW_SYNC_IOC_MAGIC, 0);
pub const SW_SYNC_IOC_INC: c_ulong = iow::<u32>(SW_SYNC_IOC_MAGIC, 1);

pub const SYNC_IOC_MAGIC: u8 = b'>';
pub const SYNC_IOC_MERGE: c_ulong = iowr::<sync_merge_data>(SYNC_IOC_MAGIC, 3);
pub const SYNC_IOC_FILE_INFO: c_ulong = iowr::<sync_file_info>(SYNC_IOC_MAGIC, 4);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn struct_layout_matches_kernel() {
        assert_eq!(size_of::<sw_sync_create_fence_data>(), 40);
        assert_eq!(size_of::<sync_merge_data>(), 48);
        assert_eq!(size_of::<sync_fence_info>(), 80);
        assert_eq!(size_of::<sync_file_info>(), 56);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn request_codes_match_kernel_headers() {
        assert_eq!(SW_SYNC_IOC_CREATE_FENCE, 0xc028_5700);
        assert_eq!(SW_SYNC_IOC_INC, 0x4004_5701);
        assert_eq!(SYNC_IOC_MERGE, 0xc030_3e03);
        assert_eq!(SYNC_IOC_FILE_INFO, 0xc038_3e04);
    }
}
