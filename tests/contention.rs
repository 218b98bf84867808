// Multi-threaded allocate/fill/verify/free cycles at every size tier,
// with more threads than arenas so the try-lock rotation gets exercised.

use std::thread;

use shardalloc::{alignment, allocate, arenas, cache_slots, chunks_current, free};

#[test]
fn concurrent_alloc_free_cycles() {
    // prime the state so the arena count is known
    let primer = allocate(1);
    assert!(!primer.is_null());
    unsafe { free(primer) };

    let arena_count = arenas();
    assert!(arena_count > 0);
    let threads = arena_count + (arena_count / 2).max(1);
    let mask = alignment() - 1;

    // small, mid, block-sized and big-block-sized requests
    const SIZES: [usize; 6] = [16, 64, 256, 4096, 65_536, 200_000];
    const ROUNDS: usize = 200;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let mut held: Vec<(*mut u8, usize, u8)> = Vec::new();
                    for (i, &size) in SIZES.iter().enumerate() {
                        let p = allocate(size);
                        assert!(!p.is_null(), "allocation of {} bytes failed", size);
                        assert_eq!(p as usize & mask, 0, "alignment error at {} bytes", size);
                        let tag = ((t as u8) ^ (round as u8) ^ (i as u8)) | 1;
                        unsafe { std::ptr::write_bytes(p, tag, size) };
                        held.push((p, size, tag));
                    }
                    for (p, size, tag) in held {
                        unsafe {
                            assert_eq!(p.read(), tag, "fill check failed (start)");
                            assert_eq!(p.add(size / 2).read(), tag, "fill check failed (middle)");
                            assert_eq!(p.add(size - 1).read(), tag, "fill check failed (end)");
                            free(p);
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // every thread freed everything; held chunks are bounded by the warm
    // arena blocks, the big block and the cache
    let bound = (arena_count + cache_slots() + 2) as i64;
    assert!(
        chunks_current() <= bound,
        "{} chunks held, expected at most {}",
        chunks_current(),
        bound
    );
}
