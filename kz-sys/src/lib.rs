//! Platform glue for the KzAlloc heap
//!
//! Everything the allocator needs from the host lives here: page-granular
//! virtual memory (allocate, release, decommit hint), the physical-memory
//! and core-count probes used for startup sizing, the CPU relax hint for
//! spin loops, and a non-allocating environment probe.
//!
//! Nothing in this crate may allocate through the Rust heap: the allocator
//! core calls these functions while it is the heap.

#![deny(unsafe_op_in_unsafe_fn)]

use core::ffi::CStr;
use core::fmt;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{alloc, decommit, free, physical_memory_bytes};
#[cfg(windows)]
pub use windows::{alloc, decommit, free, physical_memory_bytes};

/// The host refused a virtual-memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFailed;

impl fmt::Display for AllocFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system memory allocation failed")
    }
}

impl std::error::Error for AllocFailed {}

/// Number of hardware threads available to this process.
///
/// Used once at startup to size the page-heap shard array. Falls back to 8
/// when the host cannot say.
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
}

/// Hint to the CPU that we are inside a spin-wait read loop.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Give up the rest of this time slice to the scheduler.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

/// Read a positive integer from the process environment without allocating.
///
/// `std::env::var` builds a `String` and must not be called from inside an
/// allocator; this goes through the C environment directly and parses the
/// decimal digits in place. Returns `None` if the variable is unset, empty,
/// malformed, zero, or would overflow `usize`.
pub fn env_usize(name: &CStr) -> Option<usize> {
    #[cfg(unix)]
    {
        // SAFETY: getenv returns either null or a pointer into the process
        // environment, which outlives this call.
        let ptr = unsafe { libc::getenv(name.as_ptr()) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null getenv results are nul-terminated C strings.
        parse_usize(unsafe { CStr::from_ptr(ptr) }.to_bytes())
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Environment::GetEnvironmentVariableA;

        // A usize in decimal is at most 20 digits; anything longer is
        // malformed anyway.
        let mut buf = [0u8; 32];
        // SAFETY: the buffer and its length describe valid writable stack
        // storage.
        let len = unsafe {
            GetEnvironmentVariableA(name.as_ptr() as *const u8, buf.as_mut_ptr(), buf.len() as u32)
        } as usize;
        if len == 0 || len >= buf.len() {
            return None;
        }
        parse_usize(&buf[..len])
    }
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut value: usize = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add((b - b'0') as usize)?;
    }

    if value == 0 { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usize() {
        assert_eq!(parse_usize(b"1"), Some(1));
        assert_eq!(parse_usize(b"4096"), Some(4096));
        assert_eq!(parse_usize(b""), None);
        assert_eq!(parse_usize(b"0"), None);
        assert_eq!(parse_usize(b"12x"), None);
        assert_eq!(parse_usize(b"-3"), None);
        assert_eq!(parse_usize(b"99999999999999999999999999"), None);
    }

    #[test]
    fn test_hardware_concurrency_nonzero() {
        assert!(hardware_concurrency() >= 1);
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let size = 64 * 1024;
        let ptr = alloc(size, 8192).expect("system allocation");
        assert_eq!(ptr.as_ptr() as usize % 8192, 0);

        // The region must be writable end to end and zero-filled.
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0);
            ptr.as_ptr().write(0xA5);
            ptr.as_ptr().add(size - 1).write(0x5A);
            assert_eq!(*ptr.as_ptr(), 0xA5);
            free(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn test_decommit_keeps_range_valid() {
        let size = 128 * 1024;
        let ptr = alloc(size, 8192).expect("system allocation");
        unsafe {
            ptr.as_ptr().write(0xFF);
            decommit(ptr.as_ptr(), size);
            // On POSIX the range refaults as zero pages on next touch.
            #[cfg(unix)]
            assert_eq!(*ptr.as_ptr(), 0);
            free(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn test_physical_memory_probe() {
        // Whatever the host reports, it is at least tens of megabytes.
        assert!(physical_memory_bytes() >= 32 * 1024 * 1024);
    }
}
