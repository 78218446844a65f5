//! Allocator configuration constants

use core::ffi::CStr;

/// Page size exponent: pages are 8 KiB.
pub const PAGE_SHIFT: usize = 13;

/// The fundamental unit of the page heap.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Smallest alignment any returned pointer carries.
pub const MIN_ALIGN: usize = 8;

/// Largest request served through size classes; anything bigger goes
/// straight to the page heap.
pub const MAX_SMALL_BYTES: usize = 256 * 1024;

/// Number of size classes produced by the segmented alignment schedule
/// (16 + 56 + 56 + 112 + 24 across the five alignment bands).
pub const NUM_SIZE_CLASSES: usize = 264;

/// Span-length index bound for the page heap's small arrays: spans of
/// 1..=128 pages live in direct-indexed lists, longer spans in the ordered
/// large maps. One slot is left unused so page counts index directly.
pub const NPAGES: usize = 129;

/// Lower clamp on the per-class thread-cache capacity.
pub const THREAD_BATCH_MIN: usize = 2;

/// Upper clamp on the per-class thread-cache capacity.
pub const THREAD_BATCH_MAX: usize = 32768;

/// Upper clamp on the number of blocks carved into one central-cache span.
pub const CENTRAL_BATCH_MAX: usize = 512;

/// Bytes requested from the host per metadata-pool chunk.
pub const POOL_CHUNK_BYTES: usize = 128 * 1024;

/// Floor for the per-shard hot-page release threshold.
pub const SHARD_THRESHOLD_MIN_PAGES: usize = 4096;

/// Hard cap on the process-wide hot-page budget the thresholds are derived
/// from.
pub const SHARD_CACHE_LIMIT_BYTES: usize = 4 * 1024 * 1024 * 1024;

/// Environment variable overriding the computed per-shard release threshold
/// (in pages).
pub const SHARD_THRESHOLD_ENV: &CStr = c"KZALLOC_SHARD_THRESHOLD_PAGES";

/// Round a byte count up to whole pages.
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_MASK) >> PAGE_SHIFT
}

/// Round a byte count up to a page-size multiple.
pub const fn round_up_to_page(bytes: usize) -> usize {
    (bytes + PAGE_MASK) & !PAGE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn test_round_up_to_page() {
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
