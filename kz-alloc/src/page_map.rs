//! Radix page map: page id to owning span, readable without locks
//!
//! Every deallocation that arrives without a size resolves its span here,
//! and every coalescing step peeks at its neighbours here, so reads must
//! never take a lock. The map is a radix trie over page ids: three levels
//! on 64-bit targets (12 + 12 + 11 bits covering the 35 useful page-id
//! bits of a 48-bit address space), two on 32-bit targets (5 + 14 bits).
//! Interior nodes are allocated lazily from the host and never freed.
//!
//! Reads walk acquire-loaded pointers; a null at any level means the page
//! was never mapped, which is exactly what the caller needs to hear. The
//! grow mutex serialises node allocation only: leaf stores are single
//! aligned machine words and need no lock, and stale values are impossible
//! because every `set` happens under the writer's own bucket or shard
//! lock.

use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use crate::bootstrap;
use crate::error::fatal;
use crate::span::Span;

#[cfg(target_pointer_width = "64")]
mod geometry {
    pub const BITS_ROOT: usize = 12;
    pub const BITS_INTERIOR: usize = 12;
    pub const BITS_LEAF: usize = 11;
}

#[cfg(target_pointer_width = "32")]
mod geometry {
    pub const BITS_ROOT: usize = 5;
    pub const BITS_LEAF: usize = 14;
}

use geometry::*;

const LEN_ROOT: usize = 1 << BITS_ROOT;
const LEN_LEAF: usize = 1 << BITS_LEAF;
#[cfg(target_pointer_width = "64")]
const LEN_INTERIOR: usize = 1 << BITS_INTERIOR;

struct Leaf {
    spans: [AtomicPtr<Span>; LEN_LEAF],
}

#[cfg(target_pointer_width = "64")]
struct Interior {
    leaves: [AtomicPtr<Leaf>; LEN_INTERIOR],
}

#[cfg(target_pointer_width = "64")]
type RootNode = Interior;
#[cfg(target_pointer_width = "32")]
type RootNode = Leaf;

/// The trie. One instance exists for the whole process, in static storage.
pub struct RadixPageMap {
    root: [AtomicPtr<RootNode>; LEN_ROOT],
    /// Guards node allocation only, never lookups or leaf stores
    grow: Mutex<()>,
}

static PAGE_MAP: RadixPageMap = RadixPageMap::new();

/// The process-wide page map.
#[inline]
pub fn page_map() -> &'static RadixPageMap {
    &PAGE_MAP
}

impl RadixPageMap {
    const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(core::ptr::null_mut()) }; LEN_ROOT],
            grow: Mutex::new(()),
        }
    }

    /// Span owning `page_id`, or null if the page was never mapped.
    #[cfg(target_pointer_width = "64")]
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let i_root = page_id >> (BITS_INTERIOR + BITS_LEAF);
        if i_root >= LEN_ROOT {
            return core::ptr::null_mut();
        }

        let interior = self.root[i_root].load(Ordering::Acquire);
        if interior.is_null() {
            return core::ptr::null_mut();
        }

        let i_interior = (page_id >> BITS_LEAF) & (LEN_INTERIOR - 1);
        // SAFETY: published nodes are live forever.
        let leaf = unsafe { (*interior).leaves[i_interior].load(Ordering::Acquire) };
        if leaf.is_null() {
            return core::ptr::null_mut();
        }

        let i_leaf = page_id & (LEN_LEAF - 1);
        // SAFETY: as above.
        unsafe { (*leaf).spans[i_leaf].load(Ordering::Acquire) }
    }

    /// Span owning `page_id`, or null if the page was never mapped.
    #[cfg(target_pointer_width = "32")]
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let i_root = page_id >> BITS_LEAF;
        if i_root >= LEN_ROOT {
            return core::ptr::null_mut();
        }

        let leaf = self.root[i_root].load(Ordering::Acquire);
        if leaf.is_null() {
            return core::ptr::null_mut();
        }

        let i_leaf = page_id & (LEN_LEAF - 1);
        // SAFETY: published nodes are live forever.
        unsafe { (*leaf).spans[i_leaf].load(Ordering::Acquire) }
    }

    /// Map `page_id` to `span`, growing the trie if the branch is missing.
    ///
    /// Callers serialise per-page writes through their own locks; the map
    /// itself only serialises branch growth.
    #[cfg(target_pointer_width = "64")]
    pub fn set(&self, page_id: usize, span: *mut Span) {
        let i_root = page_id >> (BITS_INTERIOR + BITS_LEAF);
        if i_root >= LEN_ROOT {
            fatal("page id outside the mappable address range");
        }

        let interior = self.ensure(&self.root[i_root]);
        let i_interior = (page_id >> BITS_LEAF) & (LEN_INTERIOR - 1);
        // SAFETY: ensure returned a live node.
        let leaf = self.ensure(unsafe { &(*interior).leaves[i_interior] });

        let i_leaf = page_id & (LEN_LEAF - 1);
        // SAFETY: as above.
        unsafe { (*leaf).spans[i_leaf].store(span, Ordering::Release) };
    }

    /// Map `page_id` to `span`, growing the trie if the branch is missing.
    #[cfg(target_pointer_width = "32")]
    pub fn set(&self, page_id: usize, span: *mut Span) {
        let i_root = page_id >> BITS_LEAF;
        if i_root >= LEN_ROOT {
            fatal("page id outside the mappable address range");
        }

        let leaf = self.ensure(&self.root[i_root]);
        let i_leaf = page_id & (LEN_LEAF - 1);
        // SAFETY: ensure returned a live node.
        unsafe { (*leaf).spans[i_leaf].store(span, Ordering::Release) };
    }

    /// Double-checked node creation: the unlocked read handles the common
    /// case, the grow lock makes losers of the race observe the winner's
    /// node.
    fn ensure<N>(&self, slot: &AtomicPtr<N>) -> *mut N {
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let _guard = self.grow.lock().unwrap_or_else(|e| e.into_inner());
        let rechecked = slot.load(Ordering::Acquire);
        if !rechecked.is_null() {
            return rechecked;
        }

        // Host memory arrives zero-filled, which is exactly an array of
        // null atomic pointers.
        let node = match bootstrap::alloc_array::<N>(1) {
            Ok(p) => p.as_ptr(),
            Err(_) => fatal("out of memory growing the page map"),
        };
        slot.store(node, Ordering::Release);
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_reads_null() {
        let map = page_map();
        assert!(map.get(0x7777_0000).is_null());
        // Out-of-range ids answer null rather than trapping.
        assert!(map.get(usize::MAX).is_null());
    }

    #[test]
    fn test_set_get_roundtrip() {
        let map = page_map();
        let span = Box::into_raw(Box::new(Span::new(0x1234, 3)));

        for offset in 0..3 {
            map.set(0x1234 + offset, span);
        }
        assert_eq!(map.get(0x1234), span);
        assert_eq!(map.get(0x1236), span);
        assert!(map.get(0x1237).is_null());

        // Remapping a page overwrites in place.
        map.set(0x1236, core::ptr::null_mut());
        assert!(map.get(0x1236).is_null());

        drop(unsafe { Box::from_raw(span) });
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_sparse_ids_use_separate_branches() {
        let map = page_map();
        let a = Box::into_raw(Box::new(Span::new(1, 1)));
        let b = Box::into_raw(Box::new(Span::new(2, 1)));

        // Far enough apart to land in different interior nodes.
        map.set(0x10_0000, a);
        map.set(0x7_0000_0000 >> 13, b);
        assert_eq!(map.get(0x10_0000), a);
        assert_eq!(map.get(0x7_0000_0000 >> 13), b);

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }
}
