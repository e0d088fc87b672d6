//! Thin free-function API over the default process-wide allocator instance.
//!
//! Lets callers use this allocator directly (not just as `#[global_allocator]`)
//! and exposes the page-heap maintenance operations (`release_empty_spans`,
//! `madvise_idle_spans`, `pageheap_stats`) that have no place on `GlobalAlloc`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::allocator::{PAGE_HEAP, TierMalloc};
use crate::page_heap::PageHeapStats;

const DEFAULT: TierMalloc = TierMalloc;

/// Allocate `size` bytes aligned to `align`. Returns null on failure or on
/// an invalid `(size, align)` pair.
pub fn allocate(size: usize, align: usize) -> *mut u8 {
    let Ok(layout) = Layout::from_size_align(size, align) else {
        return ptr::null_mut();
    };
    unsafe { DEFAULT.alloc(layout) }
}

/// Free a block previously returned by [`allocate`] or [`reallocate`].
///
/// # Safety
///
/// `ptr`, `size`, and `align` must match the values used to obtain the
/// allocation (as with [`GlobalAlloc::dealloc`]).
pub unsafe fn free(ptr: *mut u8, size: usize, align: usize) {
    let Ok(layout) = Layout::from_size_align(size, align) else {
        return;
    };
    unsafe { DEFAULT.dealloc(ptr, layout) };
}

/// Resize a block previously returned by [`allocate`] or [`reallocate`],
/// preserving the contents up to `min(old_size, new_size)`.
///
/// # Safety
///
/// `ptr`, `old_size`, and `align` must match the values used to obtain the
/// existing allocation (as with [`GlobalAlloc::realloc`]).
pub unsafe fn reallocate(ptr: *mut u8, old_size: usize, align: usize, new_size: usize) -> *mut u8 {
    let Ok(layout) = Layout::from_size_align(old_size, align) else {
        return ptr::null_mut();
    };
    unsafe { DEFAULT.realloc(ptr, layout, new_size) }
}

/// Snapshot of the page heap's bookkeeping: `(page_size, mapped_pages,
/// free_pages, spans_in_use, spans_free)`.
pub fn pageheap_stats() -> (usize, usize, usize, usize, usize) {
    let PageHeapStats {
        page_size,
        mapped_pages,
        free_pages,
        spans_in_use,
        spans_free,
    } = PAGE_HEAP.lock().stats();
    (page_size, mapped_pages, free_pages, spans_in_use, spans_free)
}

/// Unmap every free span with at least `min_pages` pages back to the OS.
/// Returns the number of pages reclaimed.
pub fn release_empty_spans(min_pages: usize) -> usize {
    unsafe { PAGE_HEAP.lock().release_empty_spans(min_pages) }
}

/// Advise the kernel that every free span with at least `min_pages` pages may
/// have its backing physical memory released, without unmapping or
/// unindexing it. Returns the number of pages advised.
pub fn madvise_idle_spans(min_pages: usize) -> usize {
    unsafe { PAGE_HEAP.lock().madvise_idle_spans(min_pages) }
}
