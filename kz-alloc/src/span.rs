//! Span metadata and intrusive span lists
//!
//! A span is a contiguous run of pages managed as one unit. Its metadata
//! lives in per-shard object pools, never inside the pages it describes,
//! and is threaded through exactly one intrusive doubly-linked list at a
//! time: a central-cache bucket, or one of its origin shard's hot or cold
//! lists.

use core::ptr::{self, NonNull};

use crate::bootstrap::ObjectPool;
use crate::config::PAGE_SHIFT;

/// Metadata for one contiguous run of pages.
///
/// The list hook (`prev`/`next`) is a plain pair of fields at the head of
/// the struct; list sentinels are spare `Span` objects whose other fields
/// are never read.
#[repr(C)]
pub struct Span {
    prev: *mut Span,
    next: *mut Span,

    /// First page of the run
    pub page_id: usize,
    /// Number of pages
    pub pages: usize,

    /// Block size this span is carved into, or the whole rounded-up size
    /// for a large allocation. Zero while the span sits in the page heap.
    pub obj_size: usize,
    /// Blocks currently handed out of this span
    pub use_count: usize,
    /// Free blocks inside the span, linked through their first word
    pub free_list: *mut u8,

    /// Owned by the central cache or the application, as opposed to sitting
    /// in a page-heap free list
    pub in_use: bool,
    /// Physical backing has been decommitted; the virtual range remains
    pub is_cold: bool,
    /// The page-heap shard this span was born in. Returns always route
    /// here, and coalescing never crosses it.
    pub shard_id: u8,
}

impl Span {
    pub const fn new(page_id: usize, pages: usize) -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            page_id,
            pages,
            obj_size: 0,
            use_count: 0,
            free_list: ptr::null_mut(),
            in_use: false,
            is_cold: false,
            shard_id: 0,
        }
    }

    /// Base address of the span's first page.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        (self.page_id << PAGE_SHIFT) as *mut u8
    }

    /// Successor of a linked span; the owning list's sentinel terminates
    /// iteration.
    ///
    /// # Safety
    /// `span` must be linked into a live list the caller has locked.
    #[inline]
    pub unsafe fn list_next(span: *mut Span) -> *mut Span {
        // SAFETY: linked spans have live link fields.
        unsafe { (*span).next }
    }

    /// Unlink a span from whichever list currently holds it.
    ///
    /// # Safety
    /// `span` must be linked into a live list, and the caller must hold
    /// whatever lock guards that list.
    pub unsafe fn unlink(span: *mut Span) {
        // SAFETY: a linked span's neighbours are live nodes or the sentinel.
        unsafe {
            let prev = (*span).prev;
            let next = (*span).next;
            debug_assert!(!prev.is_null() && !next.is_null());
            (*prev).next = next;
            (*next).prev = prev;
            (*span).prev = ptr::null_mut();
            (*span).next = ptr::null_mut();
        }
    }
}

/// Pool feeding sentinel nodes to every [`SpanList`] in the process, as the
/// lists themselves have nowhere to embed one: list values must stay
/// movable until `init` runs, and sentinels must never move afterwards.
static SENTINEL_POOL: ObjectPool<Span> = ObjectPool::new();

/// Intrusive doubly-linked list of spans with a pooled sentinel.
///
/// The sentinel makes push/pop/unlink branch-free. A list is unusable until
/// [`init`](Self::init) has run; every list in the allocator is initialised
/// exactly once, in place, when its owning structure is bootstrapped.
pub struct SpanList {
    sentinel: *mut Span,
}

// SAFETY: lists are only touched under their owner's lock.
unsafe impl Send for SpanList {}

impl SpanList {
    /// An uninitialised list. Usable only after [`init`](Self::init).
    pub const fn new() -> Self {
        Self {
            sentinel: ptr::null_mut(),
        }
    }

    /// Allocate and self-link the sentinel. Must run exactly once, after
    /// the list has reached its final address.
    pub fn init(&mut self) {
        debug_assert!(self.sentinel.is_null());
        let s = SENTINEL_POOL.create(Span::new(0, 0)).as_ptr();
        // SAFETY: fresh pool node.
        unsafe {
            (*s).prev = s;
            (*s).next = s;
        }
        self.sentinel = s;
    }

    /// Return the sentinel to the pool. Only for lists with bounded
    /// lifetime (large-map nodes); the list must be empty.
    ///
    /// # Safety
    /// No other reference to this list may remain.
    pub unsafe fn release(&mut self) {
        debug_assert!(self.is_empty());
        let s = self.sentinel;
        self.sentinel = ptr::null_mut();
        // SAFETY: the sentinel came from SENTINEL_POOL in init.
        unsafe { SENTINEL_POOL.recycle(NonNull::new_unchecked(s)) };
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        debug_assert!(!self.sentinel.is_null());
        // SAFETY: init linked the sentinel to itself.
        unsafe { (*self.sentinel).next == self.sentinel }
    }

    /// The sentinel pointer, for terminating iteration.
    #[inline]
    pub fn sentinel(&self) -> *mut Span {
        self.sentinel
    }

    /// First span, or the sentinel when empty.
    #[inline]
    pub fn first(&self) -> *mut Span {
        // SAFETY: the sentinel is live after init.
        unsafe { (*self.sentinel).next }
    }

    /// Link a span in at the head.
    ///
    /// # Safety
    /// `span` must be live, unlinked, and owned by the caller.
    pub unsafe fn push_front(&mut self, span: *mut Span) {
        debug_assert!(!span.is_null());
        // SAFETY: sentinel and its neighbour are live nodes.
        unsafe {
            debug_assert!((*span).prev.is_null() && (*span).next.is_null());
            let s = self.sentinel;
            let first = (*s).next;
            (*span).prev = s;
            (*span).next = first;
            (*first).prev = span;
            (*s).next = span;
        }
    }

    /// Detach and return the first span, or null when empty.
    ///
    /// # Safety
    /// The caller must hold the lock guarding this list.
    pub unsafe fn pop_front(&mut self) -> *mut Span {
        let first = self.first();
        if first == self.sentinel {
            return ptr::null_mut();
        }
        // SAFETY: first is a linked, live span.
        unsafe { Span::unlink(first) };
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_span(page_id: usize, pages: usize) -> *mut Span {
        Box::into_raw(Box::new(Span::new(page_id, pages)))
    }

    unsafe fn free_span(span: *mut Span) {
        drop(unsafe { Box::from_raw(span) });
    }

    #[test]
    fn test_push_pop_front() {
        let mut list = SpanList::new();
        list.init();
        assert!(list.is_empty());

        let a = leak_span(1, 1);
        let b = leak_span(2, 2);
        unsafe {
            list.push_front(a);
            list.push_front(b);
        }
        assert!(!list.is_empty());

        unsafe {
            assert_eq!(list.pop_front(), b);
            assert_eq!(list.pop_front(), a);
            assert!(list.pop_front().is_null());
        }
        assert!(list.is_empty());

        unsafe {
            free_span(a);
            free_span(b);
        }
    }

    #[test]
    fn test_unlink_middle() {
        let mut list = SpanList::new();
        list.init();

        let spans: Vec<*mut Span> = (1..=3).map(|i| leak_span(i, 1)).collect();
        unsafe {
            for &s in &spans {
                list.push_front(s);
            }
            // List order is now 3, 2, 1; remove the middle one.
            Span::unlink(spans[1]);

            assert_eq!(list.pop_front(), spans[2]);
            assert_eq!(list.pop_front(), spans[0]);
            assert!(list.is_empty());

            for s in spans {
                free_span(s);
            }
        }
    }

    #[test]
    fn test_iteration_order() {
        let mut list = SpanList::new();
        list.init();

        let spans: Vec<*mut Span> = (1..=4).map(|i| leak_span(i, i)).collect();
        unsafe {
            for &s in &spans {
                list.push_front(s);
            }
        }

        let mut seen = Vec::new();
        let mut it = list.first();
        while it != list.sentinel() {
            unsafe {
                seen.push((*it).page_id);
                it = Span::list_next(it);
            }
        }
        assert_eq!(seen, vec![4, 3, 2, 1]);

        unsafe {
            loop {
                let p = list.pop_front();
                if p.is_null() {
                    break;
                }
                free_span(p);
            }
        }
    }
}
