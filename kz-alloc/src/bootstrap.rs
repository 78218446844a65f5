//! Bootstrap allocation: metadata storage that bypasses the heap
//!
//! Every container inside the allocator that needs nodes of its own (span
//! metadata, list sentinels, large-map nodes, thread-cache objects, the
//! shard array, the size tables, radix-tree levels) must get that memory
//! without re-entering the public allocation path, or the allocator
//! deadlocks acquiring its own locks. Everything here talks to the host
//! directly through `kz-sys`.
//!
//! Failure policy: these allocations back paths that cannot report errors
//! (free, first-touch bootstrap), so host refusal is fatal. Only the
//! page-array helpers, which serve sized startup allocations, report
//! `AllocError`.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::config::{pages_for, PAGE_SHIFT, PAGE_SIZE, POOL_CHUNK_BYTES};
use crate::error::{fatal, AllocError};
use crate::lock::SpinLock;

/// Fixed-size object pool backed by 128 KiB host chunks.
///
/// Objects are carved from the current chunk by a bump cursor; recycled
/// objects go onto an embedded free list and are reused before the cursor
/// advances. Chunk storage is only returned to the host when the pool is
/// dropped, which for the process-static pools is never.
pub struct ObjectPool<T> {
    inner: SpinLock<PoolInner>,
    _marker: PhantomData<T>,
}

struct PoolInner {
    /// Bump cursor into the current chunk
    cursor: *mut u8,
    /// Bytes left after the cursor
    remaining: usize,
    /// Recycled objects, linked through their first word
    free_list: *mut u8,
    /// Chunk list head; each chunk's first word links to the next
    chunks: *mut u8,
}

// SAFETY: all interior pointers are reached only under the spinlock.
unsafe impl<T> Send for ObjectPool<T> {}
unsafe impl<T> Sync for ObjectPool<T> {}

impl<T> ObjectPool<T> {
    /// Create an empty pool. No host memory is requested until first use.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(PoolInner {
                cursor: ptr::null_mut(),
                remaining: 0,
                free_list: ptr::null_mut(),
                chunks: ptr::null_mut(),
            }),
            _marker: PhantomData,
        }
    }

    /// Allocate storage and move `value` into it.
    ///
    /// Aborts the process if the host refuses a chunk; see the module
    /// failure policy.
    pub fn create(&self, value: T) -> NonNull<T> {
        let slot = self.alloc_raw();
        // SAFETY: alloc_raw returns exclusive, properly aligned storage.
        unsafe { slot.as_ptr().write(value) };
        slot
    }

    /// Return an object to the pool's free list.
    ///
    /// The value is not dropped; pooled types hold no owned resources.
    ///
    /// # Safety
    /// `obj` must have come from [`create`](Self::create) on this pool (all
    /// pools of one type share storage rules, but the chunk lists are
    /// per-pool) and must not be used again.
    pub unsafe fn recycle(&self, obj: NonNull<T>) {
        let mut inner = self.inner.lock();
        let slot = obj.as_ptr() as *mut u8;
        // SAFETY: the slot is at least one word (checked below) and now dead.
        unsafe { (slot as *mut *mut u8).write(inner.free_list) };
        inner.free_list = slot;
    }

    fn alloc_raw(&self) -> NonNull<T> {
        const {
            assert!(size_of::<T>() >= size_of::<*mut u8>());
            assert!(align_of::<T>() <= align_of::<usize>());
        }

        let mut inner = self.inner.lock();

        if !inner.free_list.is_null() {
            let slot = inner.free_list;
            // SAFETY: free-list entries store the next entry in their first
            // word.
            inner.free_list = unsafe { (slot as *const *mut u8).read() };
            // SAFETY: slot came from a chunk, so it is non-null and aligned.
            return unsafe { NonNull::new_unchecked(slot as *mut T) };
        }

        if inner.remaining < size_of::<T>() {
            // Whatever is left in the old chunk is abandoned; it is smaller
            // than one object.
            let chunk = match kz_sys::alloc(POOL_CHUNK_BYTES, PAGE_SIZE) {
                Ok(p) => p.as_ptr(),
                Err(_) => fatal("out of memory allocating metadata chunk"),
            };
            // SAFETY: the chunk is fresh and at least one word long.
            unsafe { (chunk as *mut *mut u8).write(inner.chunks) };
            inner.chunks = chunk;
            // SAFETY: the cursor starts one word in, past the chunk link.
            inner.cursor = unsafe { chunk.add(size_of::<*mut u8>()) };
            inner.remaining = POOL_CHUNK_BYTES - size_of::<*mut u8>();
        }

        let slot = inner.cursor;
        // SAFETY: remaining >= size_of::<T>() keeps the cursor in-chunk.
        inner.cursor = unsafe { inner.cursor.add(size_of::<T>()) };
        inner.remaining -= size_of::<T>();
        // SAFETY: slot points into a live chunk.
        unsafe { NonNull::new_unchecked(slot as *mut T) }
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        let mut chunk = self.inner.lock().chunks;
        while !chunk.is_null() {
            // SAFETY: each chunk's first word holds the next chunk.
            let next = unsafe { (chunk as *const *mut u8).read() };
            // SAFETY: the chunk was a POOL_CHUNK_BYTES host allocation.
            unsafe { kz_sys::free(chunk, POOL_CHUNK_BYTES) };
            chunk = next;
        }
    }
}

/// Allocate zero-filled, page-aligned storage for `count` values of `T`
/// straight from the host.
///
/// Used for the handful of large flat allocations (shard array, size
/// tables, radix-tree nodes) that a bump pool cannot serve because they
/// need contiguity beyond one chunk.
pub fn alloc_array<T>(count: usize) -> Result<NonNull<T>, AllocError> {
    let bytes = count
        .checked_mul(size_of::<T>())
        .ok_or(AllocError::Overflow)?;
    let pages = pages_for(bytes).max(1);
    let ptr = kz_sys::alloc(pages << PAGE_SHIFT, PAGE_SIZE)?;
    Ok(ptr.cast())
}

/// Return storage obtained from [`alloc_array`].
///
/// # Safety
/// `ptr` and `count` must match a live `alloc_array` call.
pub unsafe fn free_array<T>(ptr: NonNull<T>, count: usize) {
    let pages = pages_for(count * size_of::<T>()).max(1);
    // SAFETY: caller guarantees this is a live array allocation.
    unsafe { kz_sys::free(ptr.as_ptr() as *mut u8, pages << PAGE_SHIFT) };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        value: usize,
        _pad: usize,
    }

    #[test]
    fn test_create_and_recycle() {
        let pool: ObjectPool<Node> = ObjectPool::new();

        let a = pool.create(Node { value: 1, _pad: 0 });
        let b = pool.create(Node { value: 2, _pad: 0 });
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(unsafe { a.as_ref() }.value, 1);
        assert_eq!(unsafe { b.as_ref() }.value, 2);

        // Recycled storage is reused before the cursor advances.
        unsafe { pool.recycle(a) };
        let c = pool.create(Node { value: 3, _pad: 0 });
        assert_eq!(c.as_ptr(), a.as_ptr());
        assert_eq!(unsafe { c.as_ref() }.value, 3);
    }

    #[test]
    fn test_spans_multiple_chunks() {
        let pool: ObjectPool<[usize; 512]> = ObjectPool::new();

        // Each object is 4 KiB; push well past one 128 KiB chunk.
        let mut ptrs = Vec::new();
        for i in 0..100 {
            let p = pool.create([i; 512]);
            ptrs.push(p);
        }
        for (i, p) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { p.as_ref() }[0], i);
        }
    }

    #[test]
    fn test_alloc_array_zeroed() {
        let ptr = alloc_array::<u64>(1000).unwrap();
        for i in 0..1000 {
            assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, 0);
        }
        unsafe { free_array(ptr, 1000) };
    }

    #[test]
    fn test_alloc_array_overflow() {
        assert_eq!(alloc_array::<u64>(usize::MAX).unwrap_err(), AllocError::Overflow);
    }
}
