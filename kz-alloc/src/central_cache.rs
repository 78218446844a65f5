//! Central cache: the broker between thread caches and the page heap
//!
//! One bucket per size class, each a span list behind its own spinlock and
//! padded to a cache line so neighbouring classes never share one. Thread
//! caches pull pre-linked batches out with [`fetch_blocks`] and push
//! surplus back with [`release_blocks`]; spans whose every block has come
//! home are handed back to their origin page-heap shard.
//!
//! Lock ordering: a bucket lock is always released before entering the
//! page heap and re-acquired afterwards, both when carving a fresh span
//! and when retiring an empty one. Holding it across the page heap would
//! invert the bucket → shard order and pin a spinlock through syscalls.

use core::ptr::{self, NonNull};
use std::sync::OnceLock;

use crate::block_list::{next_block, set_next_block};
use crate::bootstrap;
use crate::config::{NUM_SIZE_CLASSES, PAGE_SHIFT};
use crate::error::{fatal, AllocError};
use crate::lock::SpinLock;
use crate::page_heap::page_heap;
use crate::page_map::page_map;
use crate::size_class::size_map;
use crate::span::{Span, SpanList};

/// Walk bound for the release path; a healthy returned list is at most the
/// largest thread-cache cap, so anything near this is a cycle from a
/// double-free.
#[cfg(debug_assertions)]
const RELEASE_WALK_BOUND: usize = 1 << 20;

#[repr(align(64))]
struct Bucket {
    list: SpinLock<SpanList>,
}

/// Process-wide central cache.
pub struct CentralCache {
    buckets: &'static [Bucket],
}

static CENTRAL: OnceLock<CentralCache> = OnceLock::new();

/// The process-wide central cache, bootstrapped on first use.
pub fn central_cache() -> &'static CentralCache {
    CENTRAL.get_or_init(CentralCache::bootstrap)
}

/// A pre-linked chain of blocks handed to a thread cache: `count` blocks
/// from `head` to `tail`, tail link already cut.
pub struct FetchedBlocks {
    pub head: NonNull<u8>,
    pub tail: NonNull<u8>,
    pub count: usize,
}

impl CentralCache {
    fn bootstrap() -> CentralCache {
        let buckets = match bootstrap::alloc_array::<Bucket>(NUM_SIZE_CLASSES) {
            Ok(p) => p.as_ptr(),
            Err(_) => fatal("out of memory building the central cache"),
        };

        for i in 0..NUM_SIZE_CLASSES {
            // SAFETY: fresh exclusive storage, one write per slot.
            unsafe {
                let slot = buckets.add(i);
                slot.write(Bucket {
                    list: SpinLock::new(SpanList::new()),
                });
                (*slot).list.lock().init();
            }
        }

        CentralCache {
            // SAFETY: fully initialised, never freed.
            buckets: unsafe { core::slice::from_raw_parts(buckets, NUM_SIZE_CLASSES) },
        }
    }

    /// Detach up to `want` blocks of the class serving `size` requests.
    ///
    /// Always returns at least one block on success; fewer than `want`
    /// when the serving span's free list runs dry first. The chain
    /// preserves the span's internal order; callers must not assume the
    /// blocks are contiguous.
    ///
    /// `size` may be the raw request size: raw and rounded sizes share a
    /// class, and rounding is deferred to the carve path where it is
    /// actually needed.
    pub fn fetch_blocks(&self, want: usize, size: usize) -> Result<FetchedBlocks, AllocError> {
        debug_assert!(want >= 1);
        let class = size_map().class_index(size);
        let bucket = &self.buckets[class];
        let mut list = bucket.list.lock();

        let span = match find_loaded(&list) {
            Some(span) => span,
            None => {
                // Nothing to hand out; carve a fresh span outside the lock.
                drop(list);
                let fresh = carve_span(size)?;
                list = bucket.list.lock();
                // SAFETY: the fresh span is invisible to other threads
                // until this push.
                unsafe { list.push_front(fresh) };
                fresh
            }
        };

        // SAFETY: the span is ours under the bucket lock and its free list
        // is non-empty.
        unsafe {
            let head = (*span).free_list;
            debug_assert!(!head.is_null());
            let mut tail = head;
            let mut count = 1;
            while count < want {
                let next = next_block(tail);
                if next.is_null() {
                    break;
                }
                tail = next;
                count += 1;
            }

            (*span).free_list = next_block(tail);
            set_next_block(tail, ptr::null_mut());
            (*span).use_count += count;

            drop(list);
            Ok(FetchedBlocks {
                head: NonNull::new_unchecked(head),
                tail: NonNull::new_unchecked(tail),
                count,
            })
        }
    }

    /// Return a chain of blocks to their owning spans.
    ///
    /// The chain may mix blocks from different spans of the class (it
    /// usually does: thread caches interleave). A span whose `use_count`
    /// reaches zero is retired to its origin shard, with the bucket lock
    /// dropped around the hand-off.
    ///
    /// # Safety
    /// Every block in the chain must be a dead block of the class serving
    /// `size`, previously fetched from this cache.
    pub unsafe fn release_blocks(&self, head: *mut u8, size: usize) {
        let class = size_map().class_index(size);
        let bucket = &self.buckets[class];
        let mut list = bucket.list.lock();

        #[cfg(debug_assertions)]
        let mut walked = 0usize;

        let mut cur = head;
        while !cur.is_null() {
            #[cfg(debug_assertions)]
            {
                walked += 1;
                if walked > RELEASE_WALK_BOUND {
                    fatal("cyclic free list in release path (double free?)");
                }
            }

            // SAFETY: per the contract, cur is a dead block we own.
            let next = unsafe { next_block(cur) };

            let span = page_map().get(cur as usize >> PAGE_SHIFT);
            if span.is_null() {
                fatal("released block not owned by the heap");
            }

            // SAFETY: the span is pinned by the bucket lock; the block
            // becomes part of its free list.
            unsafe {
                set_next_block(cur, (*span).free_list);
                (*span).free_list = cur;
                debug_assert!((*span).use_count > 0);
                (*span).use_count -= 1;

                if (*span).use_count == 0 {
                    // Every block is home: retire the span. Drop the bucket
                    // lock first: the shard coalesces and may call into
                    // the host.
                    Span::unlink(span);
                    (*span).free_list = ptr::null_mut();
                    drop(list);
                    page_heap().release_span(span);
                    list = bucket.list.lock();
                }
            }

            cur = next;
        }

        drop(list);
    }
}

/// First span in the bucket with blocks left to hand out.
fn find_loaded(list: &SpanList) -> Option<*mut Span> {
    let mut it = list.first();
    while it != list.sentinel() {
        // SAFETY: bucket spans are live while linked.
        unsafe {
            if !(*it).free_list.is_null() {
                return Some(it);
            }
            it = Span::list_next(it);
        }
    }
    None
}

/// Take a span from the page heap and carve it into blocks.
///
/// This is the only place the allocation path rounds a request up: the
/// block stride is the full class size, so a span never fragments
/// internally. A trailing remainder smaller than one block stays unlinked
/// and idle until the whole span is retired.
fn carve_span(size: usize) -> Result<*mut Span, AllocError> {
    let map = size_map();
    let block = map.round_up(size);
    let count = map.carve_count(block);
    let pages = ((count * block) >> PAGE_SHIFT).max(1);

    let span = page_heap().new_span(pages)?;

    // SAFETY: the span's pages are fresh, writable, and exclusively ours.
    unsafe {
        (*span).obj_size = block;

        let start = (*span).base();
        let bytes = (*span).pages << PAGE_SHIFT;
        let last = start.add(bytes - block);

        (*span).free_list = start;
        let mut tail = start;
        let mut cur = start.add(block);
        while cur <= last {
            set_next_block(tail, cur);
            tail = cur;
            cur = cur.add(block);
        }
        set_next_block(tail, ptr::null_mut());
    }

    Ok(span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_is_linked_and_distinct() {
        let cache = central_cache();
        let fetched = cache.fetch_blocks(16, 64).unwrap();
        assert!(fetched.count >= 1 && fetched.count <= 16);

        let mut seen = Vec::new();
        let mut cur = fetched.head.as_ptr();
        while !cur.is_null() {
            assert_eq!(cur as usize % 8, 0);
            assert!(!seen.contains(&cur));
            seen.push(cur);
            cur = unsafe { next_block(cur) };
        }
        assert_eq!(seen.len(), fetched.count);

        unsafe { cache.release_blocks(fetched.head.as_ptr(), 64) };
    }

    #[test]
    fn test_release_then_refetch() {
        let cache = central_cache();
        let first = cache.fetch_blocks(8, 4096).unwrap();
        let count = first.count;
        unsafe { cache.release_blocks(first.head.as_ptr(), 4096) };

        // Whether the span survived in the bucket or was retired and
        // re-carved, a refetch must succeed.
        let second = cache.fetch_blocks(count, 4096).unwrap();
        assert!(second.count >= 1);
        unsafe { cache.release_blocks(second.head.as_ptr(), 4096) };
    }
}
