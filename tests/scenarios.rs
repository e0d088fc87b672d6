//! End-to-end scenarios exercising the public allocate/free/reallocate API
//! and page heap statistics together, rather than any single tier in
//! isolation. Companion to the page-count-based scenarios already covered
//! by `page_heap`'s own unit tests (grow/best-fit over the large index).

use std::sync::Mutex;
use std::thread;
use tiermalloc::size_class::NUM_SIZE_CLASSES;
use tiermalloc::{allocate, free, pageheap_stats, reallocate, release_empty_spans};

// The central reservoir keeps one fully-drained span cached per size class
// (to avoid populate/return churn on a single alloc+dealloc cycle), so
// `spans_in_use` settles at "at most one retained span per touched class"
// rather than exactly zero once any small allocation has occurred.
const MAX_RESIDUAL_SPANS: usize = NUM_SIZE_CLASSES;

// These tests all observe the one process-wide page heap, so they must not
// run concurrently with each other (cargo runs #[test] fns in parallel by
// default within a binary).
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn cyclic_small_block_churn_drains_to_zero_in_use() {
    let _guard = SERIAL.lock().unwrap();
    // 2,000 small blocks of sizes 1..120 cyclically; overwrite each;
    // realloc every 7th to a size in 50..249; free all.
    let mut blocks: Vec<(*mut u8, usize)> = Vec::with_capacity(2000);

    for i in 0..2000usize {
        let size = 1 + (i % 120);
        let ptr = allocate(size, 1);
        assert!(!ptr.is_null(), "allocate({size}) returned null at i={i}");
        unsafe { ptr.write_bytes(0xAB, size) };
        blocks.push((ptr, size));
    }

    for i in (0..blocks.len()).step_by(7) {
        let (ptr, old_size) = blocks[i];
        let new_size = 50 + (i % 199);
        let new_ptr = unsafe { reallocate(ptr, old_size, 1, new_size) };
        assert!(!new_ptr.is_null(), "realloc failed at i={i}");
        blocks[i] = (new_ptr, new_size);
    }

    for (ptr, size) in blocks {
        unsafe { free(ptr, size, 1) };
    }

    let (_, _, _, spans_in_use, _) = pageheap_stats();
    assert!(spans_in_use <= MAX_RESIDUAL_SPANS, "spans_in_use={spans_in_use}");

    release_empty_spans(1);
}

#[test]
fn large_bypass_allocation_reclaims() {
    let _guard = SERIAL.lock().unwrap();
    let (page_size, before_mapped, before_free, _, _) = pageheap_stats();
    let size = page_size * 3 + 123;

    let ptr = allocate(size, 1);
    assert!(!ptr.is_null());
    unsafe { ptr.write_bytes(0xCD, size) };
    for i in 0..size {
        assert_eq!(unsafe { *ptr.add(i) }, 0xCD);
    }
    unsafe { free(ptr, size, 1) };

    // PH-backed: free_pages rose by the span's page count (>= 3 pages);
    // a reclaim unmaps it and mapped_pages returns to (at most) its prior value.
    let (_, _, after_free, _, _) = pageheap_stats();
    assert!(after_free >= before_free);

    release_empty_spans(1);
    let (_, after_mapped, _, _, _) = pageheap_stats();
    assert!(after_mapped <= before_mapped + page_size); // no net page growth survives reclaim
}

#[test]
fn eight_threads_four_thousand_allocs_each() {
    let _guard = SERIAL.lock().unwrap();
    let nthreads = 8;
    let ops = 4000;

    let handles: Vec<_> = (0..nthreads)
        .map(|tid| {
            thread::spawn(move || {
                let mut live: Vec<(*mut u8, usize)> = Vec::with_capacity(64);
                for i in 0..ops {
                    let size = 1 + ((tid * 97 + i) % 256);
                    let ptr = allocate(size, 1);
                    assert!(!ptr.is_null());
                    live.push((ptr, size));

                    if i % 5 == 0 {
                        let idx = live.len() - 1;
                        let (p, old) = live[idx];
                        let new_size = 1 + ((old * 3 + i) % 256);
                        let new_ptr = unsafe { reallocate(p, old, 1, new_size) };
                        assert!(!new_ptr.is_null());
                        live[idx] = (new_ptr, new_size);
                    }
                }
                for (ptr, size) in live {
                    unsafe { free(ptr, size, 1) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let (_, _, _, spans_in_use, _) = pageheap_stats();
    assert!(spans_in_use <= MAX_RESIDUAL_SPANS, "spans_in_use={spans_in_use}");
}

#[test]
fn adversarial_churn_across_threads() {
    let _guard = SERIAL.lock().unwrap();
    const SLOTS: usize = 1024;
    const THREADS: usize = 8;
    const ITERATIONS: usize = 100;

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            thread::spawn(move || {
                let mut slots: Vec<Option<(*mut u8, usize)>> = vec![None; SLOTS];
                let mut rng = (tid as u64).wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
                let mut next = move || {
                    rng ^= rng << 13;
                    rng ^= rng >> 7;
                    rng ^= rng << 17;
                    rng
                };

                for _ in 0..ITERATIONS * SLOTS {
                    let slot = (next() as usize) % SLOTS;
                    match slots[slot].take() {
                        None => {
                            let op = next() % 3;
                            let size = if op == 0 {
                                1 + (next() as usize % 256) // small
                            } else {
                                4096 + (next() as usize % 65536) // large
                            };
                            let ptr = allocate(size, 1);
                            assert!(!ptr.is_null());
                            slots[slot] = Some((ptr, size));
                        }
                        Some((ptr, size)) => {
                            let op = next() % 3;
                            match op {
                                0 => unsafe { free(ptr, size, 1) },
                                1 => {
                                    let new_size = 1 + (next() as usize % 131072);
                                    let new_ptr = unsafe { reallocate(ptr, size, 1, new_size) };
                                    assert!(!new_ptr.is_null());
                                    slots[slot] = Some((new_ptr, new_size));
                                }
                                _ => {
                                    // free-null: drop the slot without touching the allocator.
                                    unsafe { free(ptr, size, 1) };
                                }
                            }
                        }
                    }
                }

                for slot in slots.into_iter().flatten() {
                    unsafe { free(slot.0, slot.1, 1) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let (_, _, _, spans_in_use, _) = pageheap_stats();
    assert!(spans_in_use <= MAX_RESIDUAL_SPANS, "spans_in_use={spans_in_use}");

    release_empty_spans(1);
}
