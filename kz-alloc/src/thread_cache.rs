//! Thread caches: the synchronisation-free front end
//!
//! Each thread owns a cache of free lists, one per size class, reached
//! through TLS. The hot paths, a pop on allocate and a push on deallocate,
//! touch nothing shared. Refills pull batches from the central cache on a
//! slow-start schedule (doubling from one block up to the class cap), so
//! a thread that allocates two blocks of some size never hoards five
//! hundred, while a hot loop quickly earns full batches. A list that
//! outgrows its cap hands a batch back.
//!
//! The cache objects themselves come from a bootstrap pool: TLS
//! construction happens in the middle of an allocation, where the heap
//! must not be re-entered.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use crate::block_list::{next_block, set_next_block, BlockList};
use crate::bootstrap::ObjectPool;
use crate::central_cache::central_cache;
use crate::config::NUM_SIZE_CLASSES;
use crate::error::AllocError;
use crate::size_class::size_map;

/// Per-thread allocation cache.
pub struct ThreadCache {
    lists: [BlockList; NUM_SIZE_CLASSES],
}

impl ThreadCache {
    fn new() -> Self {
        let map = size_map();
        let mut lists = [const { BlockList::new() }; NUM_SIZE_CLASSES];
        for (class, list) in lists.iter_mut().enumerate() {
            list.set_cap(map.batch_max(class));
        }
        Self { lists }
    }

    /// Serve a small request from this thread's lists, refilling from the
    /// central cache when the class runs dry.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = size_map().class_index(size);
        let list = &mut self.lists[class];

        if !list.is_empty() {
            // SAFETY: list blocks are dead memory owned by this cache.
            let block = unsafe { list.pop() };
            // SAFETY: non-empty list popped non-null.
            return Ok(unsafe { NonNull::new_unchecked(block) });
        }

        self.refill(class, size)
    }

    /// Take a dead block back. Runs the trim protocol when the class list
    /// has grown past its slow-start ceiling plus cap.
    ///
    /// # Safety
    /// `block` must be a block of the class serving `size`, allocated from
    /// this heap and not freed since.
    pub unsafe fn deallocate(&mut self, block: NonNull<u8>, size: usize) {
        let class = size_map().class_index(size);
        let list = &mut self.lists[class];

        // SAFETY: the caller hands over a dead block.
        unsafe { list.push(block.as_ptr()) };

        if list.len() >= list.batch() + list.cap() {
            self.trim(class, size);
        }
    }

    /// Slow-start refill: double the batch (up to the class cap), fetch,
    /// keep the first block for the caller and splice the rest in O(1).
    fn refill(&mut self, class: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let list = &mut self.lists[class];

        let batch = (list.batch() << 1).min(list.cap());
        list.set_batch(batch);

        let fetched = central_cache().fetch_blocks(batch, size)?;

        if fetched.count > 1 {
            // SAFETY: fetch_blocks returns a well-formed chain; the first
            // block goes to the caller, the remainder to the list.
            unsafe {
                let rest = next_block(fetched.head.as_ptr());
                self.lists[class].push_range(rest, fetched.tail.as_ptr(), fetched.count - 1);
            }
        }

        Ok(fetched.head)
    }

    /// Hand one cap's worth of blocks back to the central cache.
    fn trim(&mut self, class: usize, size: usize) {
        let list = &mut self.lists[class];
        let surplus = list.cap();

        // SAFETY: the trim threshold guarantees at least `surplus` blocks.
        let (head, _tail) = unsafe { list.pop_range(surplus) };
        // SAFETY: the detached chain is dead blocks of this class.
        unsafe { central_cache().release_blocks(head, size) };
    }

    /// Flush every list back to the central cache. Runs at thread exit so
    /// a retiring thread's blocks go back into circulation instead of
    /// sleeping in a pooled cache object.
    fn drain(&mut self) {
        let map = size_map();
        for class in 0..NUM_SIZE_CLASSES {
            let list = &mut self.lists[class];
            let len = list.len();
            if len == 0 {
                continue;
            }
            let size = map.class_size(class);
            // SAFETY: the whole list is detached and released.
            unsafe {
                let (head, _tail) = list.pop_range(len);
                central_cache().release_blocks(head, size);
            }
        }
    }
}

static CACHE_POOL: ObjectPool<ThreadCache> = ObjectPool::new();

thread_local! {
    static TLS_CACHE: CacheSlot = const {
        CacheSlot {
            cache: Cell::new(ptr::null_mut()),
        }
    };
}

/// TLS anchor owning this thread's cache for the thread's lifetime.
struct CacheSlot {
    cache: Cell<*mut ThreadCache>,
}

impl CacheSlot {
    fn get_or_create(&self) -> *mut ThreadCache {
        let mut cache = self.cache.get();
        if cache.is_null() {
            cache = CACHE_POOL.create(ThreadCache::new()).as_ptr();
            self.cache.set(cache);
        }
        cache
    }
}

impl Drop for CacheSlot {
    fn drop(&mut self) {
        let cache = self.cache.get();
        if cache.is_null() {
            return;
        }
        self.cache.set(ptr::null_mut());
        // SAFETY: the thread is exiting; nothing else refers to its cache.
        unsafe {
            (*cache).drain();
            CACHE_POOL.recycle(NonNull::new_unchecked(cache));
        }
    }
}

/// Allocate a small request through this thread's cache.
pub fn tls_allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    TLS_CACHE
        .try_with(|slot| {
            let cache = slot.get_or_create();
            // SAFETY: the cache is exclusively this thread's.
            unsafe { (*cache).allocate(size) }
        })
        // TLS already destroyed (late allocation during thread teardown):
        // fetch a single block straight from the central cache.
        .unwrap_or_else(|_| central_cache().fetch_blocks(1, size).map(|f| f.head))
}

/// Free a small block through this thread's cache.
///
/// # Safety
/// `block` must be a live allocation of the class serving `size`.
pub unsafe fn tls_deallocate(block: NonNull<u8>, size: usize) {
    let routed = TLS_CACHE.try_with(|slot| {
        let cache = slot.get_or_create();
        // SAFETY: the cache is exclusively this thread's.
        unsafe { (*cache).deallocate(block, size) };
    });

    if routed.is_err() {
        // TLS already destroyed: release directly to the central cache as
        // a chain of one.
        // SAFETY: the block is dead from here on.
        unsafe {
            set_next_block(block.as_ptr(), ptr::null_mut());
            central_cache().release_blocks(block.as_ptr(), size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_thread_reuse_is_lifo() {
        let p = tls_allocate(48).unwrap();
        unsafe { tls_deallocate(p, 48) };
        let q = tls_allocate(48).unwrap();
        assert_eq!(p, q);
        unsafe { tls_deallocate(q, 48) };
    }

    #[test]
    fn test_slow_start_doubles() {
        TLS_CACHE.with(|slot| {
            let cache = unsafe { &mut *slot.get_or_create() };
            let class = size_map().class_index(1024);
            let before = cache.lists[class].batch();

            let p = cache.allocate(1024).unwrap();
            // One refill happened (the class list started empty in this
            // thread), so the batch grew but stayed within the cap.
            let after = cache.lists[class].batch();
            assert!(after >= before);
            assert!(after <= cache.lists[class].cap());

            unsafe { cache.deallocate(p, 1024) };
        });
    }

    #[test]
    fn test_trim_bounds_list_length() {
        TLS_CACHE.with(|slot| {
            let cache = unsafe { &mut *slot.get_or_create() };
            let size = 256;
            let class = size_map().class_index(size);
            let cap = cache.lists[class].cap();

            let mut ptrs = Vec::new();
            for _ in 0..3 * cap {
                ptrs.push(cache.allocate(size).unwrap());
            }
            for p in ptrs {
                unsafe { cache.deallocate(p, size) };
            }

            // However the frees interleaved with trims, the list never
            // ends deeper than one trim threshold.
            let list = &cache.lists[class];
            assert!(list.len() < list.batch() + list.cap());
        });
    }
}
