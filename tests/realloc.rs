// Reallocation contracts: in-place growth of the latest slice, copying
// moves, the zero-size/null edge cases, and the big-block in-place path.
//
// Everything runs in one test function: the in-place assertions depend on
// this thread staying the sole user of its arena (and of the shared big
// block) between calls, so no concurrent test thread may allocate.

use shardalloc::{allocate, alignment, free, realloc_is_safe, reallocate2};

#[test]
fn reallocation_contracts() {
    // move the arena cursor off zero first: the latest-slice fast path
    // reads a zero cursor as "no previous slice"
    let warmup = allocate(48);
    assert!(!warmup.is_null());

    unsafe {
        // grow in place: latest slice with room in the block keeps its address
        let p = allocate(32);
        assert!(!p.is_null());
        for i in 0..32 {
            p.add(i).write(0xA5);
        }
        let q = reallocate2(p, 64, 32);
        assert_eq!(q, p, "latest slice with room should grow in place");
        for i in 0..32 {
            assert_eq!(q.add(i).read(), 0xA5);
        }

        // grow past the block: the data moves, preserved bytes intact
        let r = reallocate2(q, 1 << 20, 32);
        assert!(!r.is_null());
        assert_ne!(r, q);
        assert_eq!(r as usize & (alignment() - 1), 0);
        for i in 0..32 {
            assert_eq!(r.add(i).read(), 0xA5);
        }
        if realloc_is_safe() {
            assert_eq!(r.add(32).read(), 0, "growth bytes should read as zero");
        }

        // shrinking to zero frees and returns the sentinel
        let sentinel = allocate(0);
        let z = reallocate2(r, 0, 0);
        assert_eq!(z, sentinel);

        // null and the sentinel act as plain allocation
        let fresh = reallocate2(std::ptr::null_mut(), 16, 0);
        assert!(!fresh.is_null());
        assert_ne!(fresh, sentinel);
        let fresh2 = reallocate2(sentinel, 16, 0);
        assert!(!fresh2.is_null());
        assert_ne!(fresh2, sentinel);
        free(fresh);
        free(fresh2);
        free(warmup);

        // a move that only vouches for a 16-byte prefix
        if realloc_is_safe() {
            let p = allocate(64);
            assert!(!p.is_null());
            for i in 0..64 {
                p.add(i).write(0x77);
            }
            let q = reallocate2(p, 1 << 20, 16);
            assert!(!q.is_null());
            for i in 0..16 {
                assert_eq!(q.add(i).read(), 0x77);
            }
            // everything past the preserved prefix reads as zero
            for i in 16..64 {
                assert_eq!(q.add(i).read(), 0);
            }
            free(q);
        }

        // big-block tier: two big slices so the second sits at a non-zero
        // cursor, then grow the latest one in place
        #[cfg(feature = "big-alloc")]
        {
            let first = allocate(200_000);
            assert!(!first.is_null());
            let second = allocate(150_000);
            assert!(!second.is_null());
            for i in (0..150_000).step_by(4096) {
                second.add(i).write(0x3C);
            }
            let grown = reallocate2(second, 200_000, 150_000);
            assert_eq!(grown, second, "latest big slice should grow in place");
            for i in (0..150_000).step_by(4096) {
                assert_eq!(grown.add(i).read(), 0x3C);
            }
            free(grown);
            free(first);
        }
    }
}
