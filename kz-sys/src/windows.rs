//! Virtual-memory primitives for Windows hosts

use core::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

use crate::AllocFailed;

/// Allocate `size` bytes of zero-filled memory aligned to `align`.
///
/// VirtualAlloc regions start on the 64 KiB allocation granularity, which
/// already satisfies every alignment the allocator asks for.
pub fn alloc(size: usize, align: usize) -> Result<NonNull<u8>, AllocFailed> {
    debug_assert!(align.is_power_of_two());
    debug_assert!(align <= 64 * 1024);

    // SAFETY: reserving and committing a fresh region has no preconditions.
    let ptr = unsafe {
        VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
    };
    NonNull::new(ptr as *mut u8).ok_or(AllocFailed)
}

/// Release a region reserved by [`alloc`].
///
/// # Safety
/// `ptr` must be the base address of a live region returned by [`alloc`].
pub unsafe fn free(ptr: *mut u8, _size: usize) {
    if ptr.is_null() {
        return;
    }
    // MEM_RELEASE frees the whole reservation; the size must be zero.
    // SAFETY: caller guarantees ptr is a live region base.
    unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
}

/// Decommit the physical backing of a range while keeping the reservation.
///
/// # Safety
/// The range must lie inside a live region returned by [`alloc`].
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    // SAFETY: caller guarantees the range is committed.
    unsafe { VirtualFree(ptr as *mut _, size, MEM_DECOMMIT) };
}

/// Total physical memory of the host, with an 8 GiB fallback when the probe
/// fails.
pub fn physical_memory_bytes() -> usize {
    let mut status = MEMORYSTATUSEX {
        dwLength: core::mem::size_of::<MEMORYSTATUSEX>() as u32,
        dwMemoryLoad: 0,
        ullTotalPhys: 0,
        ullAvailPhys: 0,
        ullTotalPageFile: 0,
        ullAvailPageFile: 0,
        ullTotalVirtual: 0,
        ullAvailVirtual: 0,
        ullAvailExtendedVirtual: 0,
    };
    // SAFETY: status is a properly initialised MEMORYSTATUSEX.
    if unsafe { GlobalMemoryStatusEx(&mut status) } != 0 && status.ullTotalPhys > 0 {
        return status.ullTotalPhys as usize;
    }
    8 * 1024 * 1024 * 1024
}
