//! Size classes: request bytes to class index and back in O(1)
//!
//! Requests up to 256 KiB round up to one of 264 block sizes laid out in
//! five alignment bands:
//!
//! | request range      | alignment |
//! |--------------------|-----------|
//! | (0, 128]           | 8 B       |
//! | (128, 1024]        | 16 B      |
//! | (1 KiB, 8 KiB]     | 128 B     |
//! | (8 KiB, 64 KiB]    | 512 B     |
//! | (64 KiB, 256 KiB]  | 8 KiB     |
//!
//! Both directions are direct table lookups. The request table has one
//! entry per byte count, which costs half a megabyte but keeps the hottest
//! lookup in the allocator to a single indexed load; the tables live in
//! host memory obtained through the bootstrap path and are built exactly
//! once.

use std::sync::OnceLock;

use crate::bootstrap;
use crate::config::{
    round_up_to_page, CENTRAL_BATCH_MAX, MAX_SMALL_BYTES, NUM_SIZE_CLASSES, THREAD_BATCH_MAX,
    THREAD_BATCH_MIN,
};
use crate::error::fatal;

/// The two lookup tables. Built once at startup, read-only afterwards.
pub struct SizeMap {
    /// Request bytes (0..=MAX_SMALL_BYTES) to class index
    size_to_class: [u16; MAX_SMALL_BYTES + 1],
    /// Class index to rounded-up block size
    class_to_size: [usize; NUM_SIZE_CLASSES],
}

static SIZE_MAP: OnceLock<&'static SizeMap> = OnceLock::new();

/// The process-wide size map, built on first use.
pub fn size_map() -> &'static SizeMap {
    SIZE_MAP.get_or_init(SizeMap::bootstrap)
}

impl SizeMap {
    /// Class index for a request. Requests of zero bytes share the smallest
    /// class.
    ///
    /// Callers may pass either the raw request size or its rounded-up block
    /// size: both land in the same class, which is what lets the hot paths
    /// skip [`round_up`](Self::round_up) entirely.
    #[inline]
    pub fn class_index(&self, size: usize) -> usize {
        debug_assert!(size <= MAX_SMALL_BYTES);
        self.size_to_class[size] as usize
    }

    /// Block size of a class.
    #[inline]
    pub fn class_size(&self, class: usize) -> usize {
        debug_assert!(class < NUM_SIZE_CLASSES);
        self.class_to_size[class]
    }

    /// Round a request up to its allocated size: the class block size below
    /// the small-object ceiling, whole pages above it.
    #[inline]
    pub fn round_up(&self, size: usize) -> usize {
        if size > MAX_SMALL_BYTES {
            return round_up_to_page(size);
        }
        self.class_to_size[self.class_index(size)]
    }

    /// Per-class upper bound on a thread cache's free list, which doubles as
    /// the ceiling for slow-start refill batches.
    #[inline]
    pub fn batch_max(&self, class: usize) -> usize {
        (MAX_SMALL_BYTES / self.class_size(class)).clamp(THREAD_BATCH_MIN, THREAD_BATCH_MAX)
    }

    /// How many blocks the central cache carves into a fresh span of this
    /// block size.
    #[inline]
    pub fn carve_count(&self, block_size: usize) -> usize {
        (MAX_SMALL_BYTES / block_size).clamp(1, CENTRAL_BATCH_MAX)
    }

    /// Smallest class whose block size fits `size` and is a multiple of
    /// `align`, or `None` when no class qualifies and the request must take
    /// the page path.
    ///
    /// Blocks sit at block-size strides from a page-aligned span base, so a
    /// class whose size `align` divides yields pointers aligned to `align`
    /// for any `align` up to the page size.
    pub fn class_for_align(&self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        // Span bases are only page-aligned, so no stride can promise more
        // than page alignment.
        if align > crate::config::PAGE_SIZE {
            return None;
        }
        let effective = size.max(align);
        if effective > MAX_SMALL_BYTES {
            return None;
        }
        let mut class = self.class_index(effective);
        while class < NUM_SIZE_CLASSES {
            if self.class_to_size[class] % align == 0 {
                return Some(class);
            }
            class += 1;
        }
        None
    }

    /// Build the tables in bootstrap storage.
    ///
    /// Walks every request size from 1 byte up, advancing to the next class
    /// whenever the request outgrows the current block. The struct is far
    /// too large for the stack, so it is constructed in place in zeroed
    /// host memory.
    fn bootstrap() -> &'static SizeMap {
        let ptr = match bootstrap::alloc_array::<SizeMap>(1) {
            Ok(p) => p.as_ptr(),
            Err(_) => fatal("out of memory building size tables"),
        };

        // SAFETY: fresh zeroed storage, exclusive until published.
        let map = unsafe { &mut *ptr };

        let mut class = 0usize;
        let mut block = 8usize;
        map.class_to_size[0] = block;

        for req in 1..=MAX_SMALL_BYTES {
            if req > block {
                class += 1;
                block = next_block_size(block);
            }
            map.size_to_class[req] = class as u16;
            map.class_to_size[class] = block;
        }
        debug_assert_eq!(class, NUM_SIZE_CLASSES - 1);

        map
    }
}

/// Step from one block size to the next along the alignment bands.
const fn next_block_size(current: usize) -> usize {
    if current < 128 {
        current + 8
    } else if current < 1024 {
        current + 16
    } else if current < 8 * 1024 {
        current + 128
    } else if current < 64 * 1024 {
        current + 512
    } else {
        current + 8 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn test_band_boundaries() {
        let m = size_map();
        assert_eq!(m.round_up(1), 8);
        assert_eq!(m.round_up(8), 8);
        assert_eq!(m.round_up(9), 16);
        assert_eq!(m.round_up(13), 16);
        assert_eq!(m.round_up(128), 128);
        assert_eq!(m.round_up(129), 144);
        assert_eq!(m.round_up(1024), 1024);
        assert_eq!(m.round_up(1025), 1152);
        assert_eq!(m.round_up(8 * 1024 + 1), 8 * 1024 + 512);
        assert_eq!(m.round_up(64 * 1024 + 1), 64 * 1024 + 8 * 1024);
        assert_eq!(m.round_up(MAX_SMALL_BYTES), MAX_SMALL_BYTES);
    }

    #[test]
    fn test_class_count() {
        let m = size_map();
        assert_eq!(m.class_index(MAX_SMALL_BYTES), NUM_SIZE_CLASSES - 1);
        assert_eq!(m.class_size(NUM_SIZE_CLASSES - 1), MAX_SMALL_BYTES);
    }

    #[test]
    fn test_round_trip_bounds() {
        // For every request, the class block covers the request and stays
        // within one alignment step of it.
        let m = size_map();
        for size in 1..=MAX_SMALL_BYTES {
            let block = m.class_size(m.class_index(size));
            assert!(block >= size, "class too small for {size}");
            let step = match size {
                s if s <= 128 => 8,
                s if s <= 1024 => 16,
                s if s <= 8 * 1024 => 128,
                s if s <= 64 * 1024 => 512,
                _ => 8 * 1024,
            };
            assert!(block < size + step, "class {block} overshoots {size}");
        }
    }

    #[test]
    fn test_raw_and_rounded_share_class() {
        let m = size_map();
        for size in 1..=MAX_SMALL_BYTES {
            assert_eq!(m.class_index(size), m.class_index(m.round_up(size)));
        }
    }

    #[test]
    fn test_large_rounds_to_pages() {
        let m = size_map();
        assert_eq!(m.round_up(MAX_SMALL_BYTES + 1), 33 * PAGE_SIZE);
        assert_eq!(m.round_up(1024 * 1024), 1024 * 1024);
    }

    #[test]
    fn test_batch_max_clamps() {
        let m = size_map();
        // 8-byte blocks: 256 KiB / 8 = 32768, at the cap.
        assert_eq!(m.batch_max(m.class_index(8)), THREAD_BATCH_MAX);
        // The largest class would give 1, clamped up to 2.
        assert_eq!(m.batch_max(NUM_SIZE_CLASSES - 1), THREAD_BATCH_MIN);
    }

    #[test]
    fn test_carve_count_clamps() {
        let m = size_map();
        assert_eq!(m.carve_count(8), CENTRAL_BATCH_MAX);
        assert_eq!(m.carve_count(MAX_SMALL_BYTES), 1);
        assert_eq!(m.carve_count(1024), 256);
    }

    #[test]
    fn test_class_for_align() {
        let m = size_map();
        assert_eq!(m.class_for_align(8, 8), Some(m.class_index(8)));
        // 48-byte class is only 16-aligned; align 32 walks up to 64.
        let c = m.class_for_align(40, 32).unwrap();
        assert_eq!(m.class_size(c) % 32, 0);
        assert!(m.class_size(c) >= 40);
        // Page-or-larger alignment has no class.
        assert_eq!(m.class_for_align(8, 2 * PAGE_SIZE), None);
    }
}
