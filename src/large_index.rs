//! Large-run index: an ordered set of free spans with `page_count > MAX_PAGES`,
//! keyed by `(page_count asc, start asc)`, supporting insert/remove/lower-bound.
//!
//! Implemented as a randomized skip list, the reference data structure named
//! by this allocator's design. Always mutated under the page heap's own
//! lock, so no internal synchronization is needed here.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::span::{MAX_SKIP_LEVELS, Span};

/// Order two spans by `(page_count, start_page)`, ascending.
#[inline]
fn less(a: &Span, b: &Span) -> bool {
    (a.num_pages, a.start_page) < (b.num_pages, b.start_page)
}

/// Cheap process-wide mix used to draw skip-list levels. The skip list is
/// always mutated under the page heap's lock, so there is no need for
/// per-thread state here -- unlike the reference implementation's per-thread
/// seeded PRNG, this is a documented simplification (see DESIGN.md).
static LEVEL_STATE: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);

fn next_bit() -> bool {
    let x = LEVEL_STATE.fetch_add(0x9E3779B97F4A7C15, Ordering::Relaxed);
    // SplitMix64-style finalizer so successive fetch_add values still mix well.
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^= z >> 31;
    z & 1 == 1
}

/// Draw a level in `[1, MAX_SKIP_LEVELS]` from a geometric (coin-flip)
/// distribution: each additional level has probability 1/2.
fn random_level() -> usize {
    let mut level = 1;
    while level < MAX_SKIP_LEVELS && next_bit() {
        level += 1;
    }
    level
}

/// Ordered index of free large spans, backed by a randomized skip list.
///
/// The sentinel head lives at `MAX_SKIP_LEVELS` and is never itself returned
/// from any query; `head[i]` is the first real node at level `i`.
pub struct LargeIndex {
    head: [*mut Span; MAX_SKIP_LEVELS],
    len: usize,
}

// SAFETY: only mutated while the caller holds the page heap's own lock.
unsafe impl Send for LargeIndex {}

impl Default for LargeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeIndex {
    pub const fn new() -> Self {
        Self {
            head: [core::ptr::null_mut(); MAX_SKIP_LEVELS],
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `span` into the index. `span` must not already be indexed.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, non-null pointer to a `Span` with a stable
    /// address for as long as it remains in the index.
    pub unsafe fn insert(&mut self, span: *mut Span) {
        let mut update: [*mut Span; MAX_SKIP_LEVELS] = [core::ptr::null_mut(); MAX_SKIP_LEVELS];
        let mut cur: *mut Span = core::ptr::null_mut();

        for i in (0..MAX_SKIP_LEVELS).rev() {
            let mut next = if cur.is_null() {
                self.head[i]
            } else {
                unsafe { (*cur).skip_next[i] }
            };
            while !next.is_null() && unsafe { less(&*next, &*span) } {
                cur = next;
                next = unsafe { (*cur).skip_next[i] };
            }
            update[i] = cur;
        }

        let level = random_level();
        unsafe {
            (*span).skip_level = level;
        }
        for i in 0..level {
            let prev = update[i];
            let next = if prev.is_null() {
                self.head[i]
            } else {
                unsafe { (*prev).skip_next[i] }
            };
            unsafe {
                (*span).skip_next[i] = next;
            }
            if prev.is_null() {
                self.head[i] = span;
            } else {
                unsafe {
                    (*prev).skip_next[i] = span;
                }
            }
        }
        self.len += 1;
    }

    /// Remove `span` from the index. `span` must currently be indexed.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, non-null pointer to a `Span` currently held by
    /// this index.
    pub unsafe fn remove(&mut self, span: *mut Span) {
        let mut update: [*mut Span; MAX_SKIP_LEVELS] = [core::ptr::null_mut(); MAX_SKIP_LEVELS];
        let mut cur: *mut Span = core::ptr::null_mut();

        for i in (0..MAX_SKIP_LEVELS).rev() {
            let mut next = if cur.is_null() {
                self.head[i]
            } else {
                unsafe { (*cur).skip_next[i] }
            };
            while !next.is_null() && next != span && unsafe { less(&*next, &*span) } {
                cur = next;
                next = unsafe { (*cur).skip_next[i] };
            }
            update[i] = cur;
        }

        let level = unsafe { (*span).skip_level };
        for i in 0..level {
            let prev = update[i];
            let next = unsafe { (*span).skip_next[i] };
            if prev.is_null() {
                if self.head[i] == span {
                    self.head[i] = next;
                }
            } else {
                unsafe {
                    if (*prev).skip_next[i] == span {
                        (*prev).skip_next[i] = next;
                    }
                }
            }
        }
        unsafe {
            (*span).skip_level = 0;
            (*span).skip_next = [core::ptr::null_mut(); MAX_SKIP_LEVELS];
        }
        self.len -= 1;
    }

    /// Return the first span with `page_count >= need` (or null if none).
    pub fn lower_bound(&self, need: usize) -> *mut Span {
        let mut cur: *mut Span = core::ptr::null_mut();
        for i in (0..MAX_SKIP_LEVELS).rev() {
            let mut next = if cur.is_null() {
                self.head[i]
            } else {
                unsafe { (*cur).skip_next[i] }
            };
            while !next.is_null() && unsafe { (*next).num_pages } < need {
                cur = next;
                next = unsafe { (*cur).skip_next[i] };
            }
        }
        if cur.is_null() {
            self.head[0]
        } else {
            unsafe { (*cur).skip_next[0] }
        }
    }

    /// The complete address-ordered chain of indexed spans (level 0), for
    /// reclamation traversal.
    #[inline]
    pub fn iter_head(&self) -> *mut Span {
        self.head[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{self};

    fn make(pages: usize, start: usize) -> *mut Span {
        let s = span::alloc_span();
        unsafe {
            (*s).num_pages = pages;
            (*s).start_page = start;
        }
        s
    }

    #[test]
    fn test_insert_lower_bound_exact_and_larger() {
        let mut idx = LargeIndex::new();
        let a = make(128, 1000);
        let b = make(96, 2000);
        unsafe {
            idx.insert(a);
            idx.insert(b);
        }
        assert_eq!(idx.len(), 2);

        let found = idx.lower_bound(100);
        assert_eq!(found, a);
        unsafe { assert_eq!((*found).num_pages, 128) };

        let found = idx.lower_bound(96);
        assert_eq!(found, b);

        let found = idx.lower_bound(200);
        assert!(found.is_null());
    }

    #[test]
    fn test_remove() {
        let mut idx = LargeIndex::new();
        let a = make(10, 0);
        let b = make(20, 100);
        let c = make(50, 200);
        unsafe {
            idx.insert(a);
            idx.insert(b);
            idx.insert(c);
            idx.remove(b);
        }
        assert_eq!(idx.len(), 2);
        let found = idx.lower_bound(15);
        assert_eq!(found, c);
    }

    #[test]
    fn test_many_inserts_sorted_traversal() {
        let mut idx = LargeIndex::new();
        let mut spans = alloc::vec::Vec::new();
        for i in 0..200usize {
            // Insert in reverse page-count order to exercise back-pointer search.
            let s = make(200 - i, i * 17);
            unsafe { idx.insert(s) };
            spans.push(s);
        }
        assert_eq!(idx.len(), 200);

        let mut cur = idx.iter_head();
        let mut last = 0usize;
        let mut count = 0;
        unsafe {
            while !cur.is_null() {
                assert!((*cur).num_pages >= last);
                last = (*cur).num_pages;
                cur = (*cur).skip_next[0];
                count += 1;
            }
        }
        assert_eq!(count, 200);
    }
}
