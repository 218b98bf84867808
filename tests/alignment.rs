// Alignment and zero-length contracts of the public allocation API.

use shardalloc::{allocate, alignment, free, realloc_is_safe, zero_allocate};

#[test]
fn alignment_sweep() {
    let mask = alignment() - 1;
    let mut ptrs = Vec::new();
    for size in 0..alignment() {
        let p = allocate(size);
        assert!(!p.is_null());
        assert_eq!(
            p as usize & mask,
            0,
            "allocation alignment error allocating {} bytes",
            size
        );
        ptrs.push(p);
    }
    for p in ptrs {
        unsafe { free(p) };
    }
}

#[test]
fn zero_length_requests_yield_the_shared_sentinel() {
    let a = allocate(0);
    let b = allocate(0);
    assert_eq!(a, b);
    assert_eq!(a as usize & (alignment() - 1), 0);
    unsafe {
        // both no-ops
        free(a);
        free(std::ptr::null_mut());
    }
    assert_eq!(allocate(0), a);
}

#[test]
fn zero_allocate_zeroes_the_whole_array() {
    let p = zero_allocate(48, 9);
    assert!(!p.is_null());
    unsafe {
        for i in 0..(48 * 9) {
            assert_eq!(p.add(i).read(), 0, "byte {} not zero", i);
        }
        free(p);
    }
}

#[test]
fn initialized_mode_returns_zeroed_memory() {
    if !realloc_is_safe() {
        return;
    }
    for &size in &[24usize, 1024, 65536] {
        let p = allocate(size);
        assert!(!p.is_null());
        unsafe {
            for i in 0..size {
                assert_eq!(p.add(i).read(), 0);
            }
            free(p);
        }
    }
}
