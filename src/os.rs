// System layer: page-granular reservations with caller-chosen alignment.
//
// `sys_alloc` hands out page-aligned regions aligned to `1 << align_log`;
// `sys_realloc` grows or shrinks a region in place when the kernel allows
// it; `sys_free` returns a region. All sizes are rounded up to whole pages.
// A shared hint address biases consecutive reservations towards adjacent
// addresses, which keeps the first mapping aligned more often than not.
//
// On failure every function returns null and never aborts; the caller
// decides whether that is fatal.

#[cfg(not(windows))]
use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::{
        errhandlingapi::GetLastError,
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    },
};

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(windows)]
use log::error;
use log::warn;

/// Log2 of the kernel page size assumed by the allocator.
pub const PAGE_SIZE_LOG: usize = 12;

/// Rounds a byte count up to whole pages.
#[inline]
pub fn round_to_pages(bytes: usize) -> usize {
    (bytes + ((1usize << PAGE_SIZE_LOG) - 1)) & (!0usize << PAGE_SIZE_LOG)
}

// Probable start of the next reservation; nudges the kernel towards
// locality across successive calls. Races are harmless, it is only a hint.
static NEXT_ALLOC: AtomicUsize = AtomicUsize::new(0x01);

#[inline]
fn take_hint(align_mask: usize) -> usize {
    (NEXT_ALLOC.load(Ordering::Relaxed) + align_mask) & !align_mask
}

#[inline]
fn update_hint(after: usize) {
    NEXT_ALLOC.store(after, Ordering::Relaxed);
}

/* -----------------------------------------------------------
  POSIX: anonymous private mappings
----------------------------------------------------------- */

/// Reserves `bytes` (rounded up to pages) aligned to `1 << align_log`.
#[cfg(not(windows))]
pub unsafe fn sys_alloc(bytes: usize, align_log: u8) -> *mut u8 {
    let bytes = round_to_pages(bytes);
    let align_size = 1usize << align_log;
    let align_mask = align_size - 1;

    let mut result = libc::mmap(
        take_hint(align_mask) as *mut libc::c_void,
        bytes,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == MAP_FAILED {
        warn!("mmap failed: {}", errno::errno());
        return null_mut();
    }

    if result as usize & align_mask != 0 {
        // the kernel ignored the hint; overallocate and trim the
        // unaligned head and tail
        libc::munmap(result, bytes);
        result = libc::mmap(
            null_mut(),
            bytes + align_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if result == MAP_FAILED {
            warn!("aligned mmap failed: {}", errno::errno());
            return null_mut();
        }
        let offset = (align_size - (result as usize & align_mask)) & align_mask;
        if offset != 0 {
            libc::munmap(result, offset);
            result = (result as usize + offset) as *mut libc::c_void;
        }
        if align_size - offset != 0 {
            libc::munmap(
                (result as usize + bytes) as *mut libc::c_void,
                align_size - offset,
            );
        }
    }

    update_hint(result as usize + (bytes << 2));
    result as *mut u8
}

/// Resizes a region, preferring in-place growth (`mremap` on Linux, an
/// adjacent mapping elsewhere) and falling back to allocate-copy-free.
#[cfg(not(windows))]
pub unsafe fn sys_realloc(mem: *mut u8, old_len: usize, new_len: usize, align_log: u8) -> *mut u8 {
    let old_len = round_to_pages(old_len);
    let new_len = round_to_pages(new_len);
    if new_len > old_len {
        #[cfg(target_os = "linux")]
        {
            let remapped = libc::mremap(mem as *mut libc::c_void, old_len, new_len, 0);
            if remapped != MAP_FAILED {
                return remapped as *mut u8;
            }
        }
        let tail = libc::mmap(
            mem.add(old_len) as *mut libc::c_void,
            new_len - old_len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if tail == mem.add(old_len) as *mut libc::c_void {
            return mem;
        }
        if tail != MAP_FAILED {
            // the kernel placed the extension elsewhere; discard it
            libc::munmap(tail, new_len - old_len);
        }
        let fresh = sys_alloc(new_len, align_log);
        if fresh.is_null() {
            return null_mut();
        }
        crate::copy::memcpy_aligned(fresh, mem, old_len);
        libc::munmap(mem as *mut libc::c_void, old_len);
        return fresh;
    }
    if old_len != new_len {
        // drop the dangling pages
        libc::munmap(mem.add(new_len) as *mut libc::c_void, old_len - new_len);
    }
    mem
}

/// Returns a region to the system.
#[cfg(not(windows))]
pub unsafe fn sys_free(mem: *mut u8, bytes: usize) {
    if mem.is_null() {
        return;
    }
    let bytes = round_to_pages(bytes);
    if libc::munmap(mem as *mut libc::c_void, bytes) == -1 {
        warn!(
            "munmap failed: {}, addr {:p}, size {}",
            errno::errno(),
            mem,
            bytes
        );
    }
}

/* -----------------------------------------------------------
  Windows: separate reservation and commitment
----------------------------------------------------------- */

/// Reserves `bytes << 2` of address space at an aligned hint, retrying with
/// an advanced hint until the kernel accepts one, then commits `bytes`.
#[cfg(windows)]
pub unsafe fn sys_alloc(bytes: usize, align_log: u8) -> *mut u8 {
    let bytes = round_to_pages(bytes);
    let align_mask = (1usize << align_log) - 1;
    let mut result: LPVOID = null_mut();
    let mut attempts = 0usize;
    while result.is_null() && attempts < 1024 {
        let hint = take_hint(align_mask);
        result = VirtualAlloc(hint as LPVOID, bytes << 2, MEM_RESERVE, PAGE_READWRITE);
        update_hint(hint + (bytes << 2));
        attempts += 1;
    }
    if result.is_null() {
        error!(
            "couldn't reserve memory from the system, error {} after {} attempts",
            GetLastError(),
            attempts
        );
        return null_mut();
    }
    let committed = VirtualAlloc(result, bytes, MEM_COMMIT, PAGE_READWRITE);
    if committed.is_null() {
        error!("couldn't commit memory after reservation, error {}", GetLastError());
        VirtualFree(result, 0, MEM_RELEASE);
        return null_mut();
    }
    committed as *mut u8
}

/// Grows by committing adjacent pages, shrinks by decommitting, and falls
/// back to allocate-copy-free when adjacent commitment fails.
#[cfg(windows)]
pub unsafe fn sys_realloc(mem: *mut u8, old_len: usize, new_len: usize, align_log: u8) -> *mut u8 {
    if new_len == 0 {
        sys_free(mem, old_len);
        return null_mut();
    }
    let old_len = round_to_pages(old_len);
    let new_len = round_to_pages(new_len);
    if new_len > old_len {
        let tail = VirtualAlloc(
            mem.add(old_len) as LPVOID,
            new_len - old_len,
            MEM_COMMIT,
            PAGE_READWRITE,
        );
        if !tail.is_null() {
            return mem;
        }
        let fresh = sys_alloc(new_len, align_log);
        if fresh.is_null() {
            error!("system realloc failed to allocate memory");
            return null_mut();
        }
        crate::copy::memcpy_aligned(fresh, mem, old_len);
        sys_free(mem, old_len);
        return fresh;
    }
    if old_len > new_len
        && VirtualFree(mem.add(new_len) as LPVOID, old_len - new_len, MEM_DECOMMIT) == 0
    {
        error!("failed to decommit memory range @ {:p}", mem);
    }
    mem
}

/// Releases a whole reservation.
#[cfg(windows)]
pub unsafe fn sys_free(mem: *mut u8, bytes: usize) {
    if mem.is_null() {
        return;
    }
    let _ = bytes;
    if VirtualFree(mem as LPVOID, 0, MEM_RELEASE) == 0 {
        warn!("memory address at {:p} couldn't be returned to the system", mem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SYS_ALLOC_LOG, SYS_ALLOC_SIZE};

    #[test]
    fn page_rounding() {
        assert_eq!(round_to_pages(0), 0);
        assert_eq!(round_to_pages(1), 4096);
        assert_eq!(round_to_pages(4096), 4096);
        assert_eq!(round_to_pages(4097), 8192);
    }

    #[test]
    fn aligned_reservation_round_trip() {
        unsafe {
            let p = sys_alloc(SYS_ALLOC_SIZE, SYS_ALLOC_LOG as u8);
            assert!(!p.is_null());
            assert_eq!(p as usize & (SYS_ALLOC_SIZE - 1), 0);
            // the memory is writable end to end
            p.write(1);
            p.add(SYS_ALLOC_SIZE - 1).write(1);
            sys_free(p, SYS_ALLOC_SIZE);
        }
    }

    #[test]
    fn realloc_grow_and_shrink() {
        unsafe {
            let p = sys_alloc(8192, PAGE_SIZE_LOG as u8);
            assert!(!p.is_null());
            for i in 0..8192 {
                p.add(i).write((i & 0xFF) as u8);
            }
            let q = sys_realloc(p, 8192, 16384, PAGE_SIZE_LOG as u8);
            assert!(!q.is_null());
            for i in 0..8192 {
                assert_eq!(q.add(i).read(), (i & 0xFF) as u8);
            }
            let r = sys_realloc(q, 16384, 8192, PAGE_SIZE_LOG as u8);
            assert_eq!(r, q);
            sys_free(r, 8192);
        }
    }
}
