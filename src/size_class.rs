//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes to reduce fragmentation and enable
//! free list management. The table is generated at build time from
//! `tiermalloc.toml` (see `build.rs`).

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of pages per span for this class.
    pub pages: usize,
    /// Number of objects to transfer between thread cache and central cache at once.
    pub batch_size: usize,
}

impl SizeClassInfo {
    pub const fn objects_per_span(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

use crate::PAGE_SIZE;

// NUM_SIZE_CLASSES, MAX_SMALL_SIZE, and SIZE_CLASSES are generated by
// build.rs from tiermalloc.toml (see SPEC_FULL.md §10).
include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Lookup table for small sizes (<= 1024 bytes).
/// Index = (size + 7) / 8, value = size class index.
/// Covers sizes 0..=1024 in 8-byte steps (129 entries).
const SMALL_LOOKUP_LEN: usize = 129; // ceil(1024/8) + 1

static SMALL_LOOKUP: [u8; SMALL_LOOKUP_LEN] = const {
    let mut table = [0u8; SMALL_LOOKUP_LEN];
    let mut i = 0;
    while i < SMALL_LOOKUP_LEN {
        let size = if i == 0 { 0 } else { i * 8 };
        // Find the smallest size class that fits this size
        let mut cls = 1u8;
        while (cls as usize) < NUM_SIZE_CLASSES {
            if SIZE_CLASSES[cls as usize].size >= size {
                break;
            }
            cls += 1;
        }
        if (cls as usize) >= NUM_SIZE_CLASSES {
            cls = (NUM_SIZE_CLASSES - 1) as u8;
        }
        table[i] = cls;
        i += 1;
    }
    table
};

/// Map an allocation size to its size class index.
/// Returns 0 if size is 0 (callers should handle this).
/// Returns a class in 1..NUM_SIZE_CLASSES-1 for valid sizes.
/// For sizes > MAX_SMALL_SIZE, returns 0 (indicating large allocation).
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size == 0 {
        return 1; // Minimum allocation is 8 bytes
    }
    if size > MAX_SMALL_SIZE {
        return 0; // Large allocation
    }
    if size <= 1024 {
        let idx = (size + 7) / 8;
        return SMALL_LOOKUP[idx] as usize;
    }
    // For sizes > 1024, do a linear scan of the upper classes.
    // There are only ~20 classes above 1024, so this is fast enough.
    let mut cls = 25; // First class with size > 1024
    while cls < NUM_SIZE_CLASSES {
        if SIZE_CLASSES[cls].size >= size {
            return cls;
        }
        cls += 1;
    }
    0 // Too large for size classes
}

/// Get the allocation size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}
