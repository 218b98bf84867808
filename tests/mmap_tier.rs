// Direct system-mapping tier: requests that bypass the pool entirely.

use shardalloc::{allocate, alignment, alloc_limit, free, mmap, reallocate2};

#[test]
fn map_round_trip() {
    let size = 8 * 1024 * 1024;
    let p = mmap(size);
    assert!(!p.is_null());
    assert_eq!(p as usize & (alignment() - 1), 0);
    unsafe {
        // writable end to end, and freeing it leaves the pool alone
        p.write(0xAB);
        p.add(size / 2).write(0xCD);
        p.add(size - 1).write(0xEF);
        assert_eq!(p.read(), 0xAB);
        assert_eq!(p.add(size - 1).read(), 0xEF);
        free(p);
    }
}

#[test]
fn map_is_forced_even_for_small_requests() {
    // a size the pool would normally serve
    let p = mmap(64);
    assert!(!p.is_null());
    unsafe {
        p.write(1);
        free(p);
    }
}

#[test]
fn oversized_allocate_takes_the_direct_path_transparently() {
    let size = alloc_limit() + 1;
    let p = allocate(size);
    assert!(!p.is_null());
    assert_eq!(p as usize & (alignment() - 1), 0);
    unsafe {
        p.add(size - 1).write(0x42);
        free(p);
    }
}

#[test]
fn map_realloc_preserves_contents() {
    let size = 4 * 1024 * 1024;
    let p = mmap(size);
    assert!(!p.is_null());
    unsafe {
        for i in 0..4096 {
            p.add(i).write((i & 0xFF) as u8);
        }
        // still above the pool limit: resized through the system layer
        let q = reallocate2(p, 3 * size, size);
        assert!(!q.is_null());
        for i in 0..4096 {
            assert_eq!(q.add(i).read(), (i & 0xFF) as u8);
        }
        q.add(3 * size - 1).write(0x99);
        free(q);
    }
}

#[test]
fn map_zero_size_yields_the_sentinel() {
    assert_eq!(mmap(0), allocate(0));
}
