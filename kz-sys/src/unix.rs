//! Virtual-memory primitives for POSIX hosts

use core::ptr::{self, NonNull};

use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use crate::AllocFailed;

/// Requests at or above this size opportunistically ask for huge pages
/// (2 MiB on the platforms that matter). A failed attempt falls back to
/// standard pages; the allocator never depends on huge pages existing.
#[cfg(target_os = "linux")]
const HUGE_PAGE_THRESHOLD: usize = 2 * 1024 * 1024;

/// Allocate `size` bytes of zero-filled memory aligned to `align`.
///
/// `align` must be a power of two. When it exceeds the OS page size the
/// request is over-mapped by one alignment unit and the misaligned head and
/// tail are unmapped again, so the caller always sees its own page geometry
/// regardless of the host's.
pub fn alloc(size: usize, align: usize) -> Result<NonNull<u8>, AllocFailed> {
    debug_assert!(align.is_power_of_two());

    #[cfg(target_os = "linux")]
    if size >= HUGE_PAGE_THRESHOLD {
        // SAFETY: anonymous private mapping, no fd, no fixed address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr != MAP_FAILED {
            // Huge-page mappings are aligned to the huge-page size, which
            // covers every alignment the allocator asks for.
            return NonNull::new(ptr as *mut u8).ok_or(AllocFailed);
        }
    }

    if align <= os_page_size() {
        let ptr = map_anonymous(size)?;
        return Ok(ptr);
    }

    // The host's pages are smaller than the caller's. Over-map by one
    // alignment unit, then trim the unaligned prefix and suffix.
    let mapped = size.checked_add(align).ok_or(AllocFailed)?;
    let raw = map_anonymous(mapped)?;

    let raw_addr = raw.as_ptr() as usize;
    let aligned_addr = (raw_addr + align - 1) & !(align - 1);

    let prefix = aligned_addr - raw_addr;
    if prefix > 0 {
        // SAFETY: the prefix lies inside the fresh mapping.
        unsafe { libc::munmap(raw_addr as *mut c_void, prefix) };
    }

    let suffix = mapped - size - prefix;
    if suffix > 0 {
        // SAFETY: the suffix lies inside the fresh mapping, past the caller's
        // region.
        unsafe { libc::munmap((aligned_addr + size) as *mut c_void, suffix) };
    }

    NonNull::new(aligned_addr as *mut u8).ok_or(AllocFailed)
}

/// Return a region to the host: both the virtual reservation and the
/// physical backing are gone afterwards.
///
/// # Safety
/// `ptr` and `size` must describe a region previously returned by [`alloc`]
/// that has not been freed.
pub unsafe fn free(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: caller guarantees the region is a live mapping of ours.
    unsafe { libc::munmap(ptr as *mut c_void, size) };
}

/// Advise the host that a range's contents are no longer needed.
///
/// The virtual reservation stays valid; touching the range afterwards faults
/// in fresh zero pages.
///
/// # Safety
/// The range must lie inside a live mapping returned by [`alloc`].
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    // SAFETY: caller guarantees the range is mapped.
    unsafe { libc::madvise(ptr as *mut c_void, size, libc::MADV_DONTNEED) };
}

/// Total physical memory of the host, with an 8 GiB fallback when the probe
/// fails.
pub fn physical_memory_bytes() -> usize {
    // SAFETY: sysconf with valid names has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        return pages as usize * page_size as usize;
    }
    8 * 1024 * 1024 * 1024
}

fn os_page_size() -> usize {
    // SAFETY: sysconf with valid names has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}

fn map_anonymous(size: usize) -> Result<NonNull<u8>, AllocFailed> {
    // SAFETY: anonymous private mapping, no fd, no fixed address.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return Err(AllocFailed);
    }
    NonNull::new(ptr as *mut u8).ok_or(AllocFailed)
}
