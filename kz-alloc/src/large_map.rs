//! Ordered map of large free spans, keyed by page count
//!
//! Spans longer than the small arrays cover (128 pages) are filed here,
//! one bucket per distinct length, kept in ascending order so a request
//! can take the smallest span that fits. Bucket nodes come from a
//! process-static bootstrap pool; the map must never allocate through
//! the heap it is part of.
//!
//! The release path inserts lazily and never erases, so a bucket whose
//! list an earlier pop emptied lingers as a ghost; lookups erase ghosts
//! when they trip over them. Distinct large lengths are few (every span
//! here exceeds a megabyte), so the linear bucket walk stays short.

use core::ptr::{self, NonNull};

use crate::bootstrap::ObjectPool;
use crate::span::{Span, SpanList};

/// One bucket: all free spans of exactly `pages` pages.
struct Bucket {
    pages: usize,
    list: SpanList,
    prev: *mut Bucket,
    next: *mut Bucket,
}

static BUCKET_POOL: ObjectPool<Bucket> = ObjectPool::new();

/// Sorted doubly-linked bucket chain, ascending by page count.
pub struct LargeMap {
    head: *mut Bucket,
}

// SAFETY: maps are only touched under their owning shard's mutex.
unsafe impl Send for LargeMap {}

impl LargeMap {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// File a span under its page count, creating the bucket if needed.
    ///
    /// # Safety
    /// `span` must be live, unlinked, and owned by the caller; the caller
    /// must hold the owning shard's lock.
    pub unsafe fn insert(&mut self, span: *mut Span) {
        // SAFETY: span is live per the contract.
        let pages = unsafe { (*span).pages };

        let mut prev: *mut Bucket = ptr::null_mut();
        let mut cur = self.head;
        // SAFETY: bucket links are maintained below.
        unsafe {
            while !cur.is_null() && (*cur).pages < pages {
                prev = cur;
                cur = (*cur).next;
            }

            let bucket = if !cur.is_null() && (*cur).pages == pages {
                cur
            } else {
                let b = BUCKET_POOL
                    .create(Bucket {
                        pages,
                        list: SpanList::new(),
                        prev,
                        next: cur,
                    })
                    .as_ptr();
                (*b).list.init();
                if prev.is_null() {
                    self.head = b;
                } else {
                    (*prev).next = b;
                }
                if !cur.is_null() {
                    (*cur).prev = b;
                }
                b
            };

            (*bucket).list.push_front(span);
        }
    }

    /// Pop a span from the smallest bucket of at least `k` pages, erasing
    /// ghost buckets on the way. Returns null when nothing fits.
    ///
    /// # Safety
    /// The caller must hold the owning shard's lock.
    pub unsafe fn pop_at_least(&mut self, k: usize) -> *mut Span {
        let mut cur = self.head;
        // SAFETY: bucket links are owned by this map.
        unsafe {
            while !cur.is_null() {
                if (*cur).pages < k {
                    cur = (*cur).next;
                    continue;
                }
                let span = (*cur).list.pop_front();
                if span.is_null() {
                    // Ghost bucket: erase and keep looking.
                    let next = (*cur).next;
                    self.erase(cur);
                    cur = next;
                    continue;
                }
                return span;
            }
        }
        ptr::null_mut()
    }

    /// Pop a span from the largest non-empty bucket, erasing ghosts from
    /// the top down. Returns null when the map holds nothing.
    ///
    /// # Safety
    /// The caller must hold the owning shard's lock.
    pub unsafe fn pop_largest(&mut self) -> *mut Span {
        let mut cur = self.tail();
        // SAFETY: bucket links are owned by this map.
        unsafe {
            while !cur.is_null() {
                let span = (*cur).list.pop_front();
                if !span.is_null() {
                    return span;
                }
                let prev = (*cur).prev;
                self.erase(cur);
                cur = prev;
            }
        }
        ptr::null_mut()
    }

    /// Sum of `pages` over every span in the map. Diagnostic traversal.
    ///
    /// # Safety
    /// The caller must hold the owning shard's lock.
    pub unsafe fn total_pages(&self) -> usize {
        let mut total = 0;
        // SAFETY: bucket and span links are owned by this map.
        unsafe {
            let mut bucket = self.head;
            while !bucket.is_null() {
                let list = &(*bucket).list;
                let mut span = list.first();
                while span != list.sentinel() {
                    total += (*span).pages;
                    span = Span::list_next(span);
                }
                bucket = (*bucket).next;
            }
        }
        total
    }

    fn tail(&self) -> *mut Bucket {
        let mut cur = self.head;
        if cur.is_null() {
            return cur;
        }
        // SAFETY: bucket links are owned by this map.
        unsafe {
            while !(*cur).next.is_null() {
                cur = (*cur).next;
            }
        }
        cur
    }

    unsafe fn erase(&mut self, bucket: *mut Bucket) {
        // SAFETY: bucket is linked into this map.
        unsafe {
            let prev = (*bucket).prev;
            let next = (*bucket).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*bucket).list.release();
            BUCKET_POOL.recycle(NonNull::new_unchecked(bucket));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_span(page_id: usize, pages: usize) -> *mut Span {
        Box::into_raw(Box::new(Span::new(page_id, pages)))
    }

    #[test]
    fn test_pop_at_least_prefers_smallest_fit() {
        let mut map = LargeMap::new();
        let small = leak_span(1, 150);
        let big = leak_span(2, 400);

        unsafe {
            map.insert(big);
            map.insert(small);

            let got = map.pop_at_least(130);
            assert_eq!(got, small);

            let got = map.pop_at_least(130);
            assert_eq!(got, big);

            assert!(map.pop_at_least(130).is_null());

            drop(Box::from_raw(small));
            drop(Box::from_raw(big));
        }
    }

    #[test]
    fn test_pop_largest_order() {
        let mut map = LargeMap::new();
        let spans = [leak_span(1, 200), leak_span(2, 500), leak_span(3, 300)];

        unsafe {
            for &s in &spans {
                map.insert(s);
            }
            assert_eq!(map.pop_largest(), spans[1]);
            assert_eq!(map.pop_largest(), spans[2]);
            assert_eq!(map.pop_largest(), spans[0]);
            assert!(map.pop_largest().is_null());
            assert!(map.is_empty());

            for s in spans {
                drop(Box::from_raw(s));
            }
        }
    }

    #[test]
    fn test_ghost_buckets_are_erased() {
        let mut map = LargeMap::new();
        let a = leak_span(1, 200);
        let b = leak_span(2, 300);

        unsafe {
            map.insert(a);
            map.insert(b);

            // Empty the 200-page bucket, leaving it as a ghost.
            assert_eq!(map.pop_at_least(200), a);

            // The next lookup walks past the ghost, erases it, and still
            // finds the 300-page span.
            assert_eq!(map.pop_at_least(150), b);

            // The 300-page bucket is a ghost now too; the next miss sweeps
            // it and the map is genuinely empty.
            assert!(map.pop_at_least(1).is_null());
            assert!(map.is_empty());

            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn test_total_pages() {
        let mut map = LargeMap::new();
        let a = leak_span(1, 200);
        let b = leak_span(2, 200);
        let c = leak_span(3, 131);

        unsafe {
            map.insert(a);
            map.insert(b);
            map.insert(c);
            assert_eq!(map.total_pages(), 531);

            let _ = map.pop_at_least(140);
            assert_eq!(map.total_pages(), 331);

            for s in [a, b, c] {
                drop(Box::from_raw(s));
            }
        }
    }
}
