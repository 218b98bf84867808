// Allocator core: the chunk cache, the chunk/block manager with its
// intrusive free list, the per-arena slice allocator, the shared big-block
// allocator and the direct mmap tier, plus the public entry points.
//
// Lock protocol: `chunk_free` and `chunk_cache_or_dealloc` are entered with
// the state lock held and release it themselves, so the system call on the
// deallocation path runs outside the lock.

use core::ptr::null_mut;
use core::sync::atomic::Ordering;

use errno::{set_errno, Errno};
use log::{debug, error, warn};

use crate::copy::{memcpy_aligned, memset_aligned};
use crate::init::{arena_at, state, state_raw};
use crate::internal::*;
use crate::os;
use crate::stats;
use crate::types::*;

/* -----------------------------------------------------------
  Zero-length allocations
----------------------------------------------------------- */

// A fixed process-wide region returned for zero-byte requests. It is never
// written through; `free` and `reallocate` recognize it by address.
#[repr(align(16))]
struct ZeroRegion([u8; ALIGN_SIZE]);

static ZERO_REGION: ZeroRegion = ZeroRegion([0; ALIGN_SIZE]);

const _: () = assert!(core::mem::align_of::<ZeroRegion>() >= ALIGN_SIZE);

#[inline]
pub(crate) fn zero_ptr() -> *mut u8 {
    &ZERO_REGION as *const ZeroRegion as *mut u8
}

/* -----------------------------------------------------------
  Arena assignment
----------------------------------------------------------- */

/// Locks and returns an arena, starting at the shard the current thread
/// hashes to and rotating over the table with try-locks. Under total
/// contention the mutex build parks on the default arena; the spin build
/// yields and starts another round.
unsafe fn arena_lock(s: *mut State) -> *mut Arena {
    use core::sync::atomic::AtomicBool;
    static WARNED: AtomicBool = AtomicBool::new(false);

    let count = (*s).arena_count;
    let default_index = hash_identity(thread_identity()) % count;
    loop {
        for i in 0..count {
            let index = (default_index + i) % count;
            let a = arena_at(s, index);
            if (*a).lock.try_lock() {
                return a;
            }
        }
        if !WARNED.swap(true, Ordering::Relaxed) {
            warn!("high arena contention; consider building with more arenas");
        }
        #[cfg(all(feature = "thread-mutex", unix))]
        {
            let a = arena_at(s, default_index);
            (*a).lock.lock();
            return a;
        }
        #[cfg(not(all(feature = "thread-mutex", unix)))]
        std::thread::yield_now();
    }
}

unsafe fn arena_unlock(a: *mut Arena) {
    debug_assert!(!a.is_null());
    (*a).lock.unlock();
}

/* -----------------------------------------------------------
  Chunk allocation / deallocation
----------------------------------------------------------- */

/// Returns a chunk to the system.
pub(crate) unsafe fn chunk_dealloc(c: *mut Chunk) {
    if c.is_null() {
        return;
    }
    os::sys_free(c as *mut u8, SYS_ALLOC_SIZE);
    stats::CHUNKS.decrease(1);
    debug!("sys-dealloc returned {:p} to system", c);
}

/// Caches the chunk if the cache has room, otherwise hands it to the
/// system. Entered with the state lock held; releases it before any
/// system call.
unsafe fn chunk_cache_or_dealloc(s: *mut State, mut c: *mut Chunk) {
    if (*s).cache.pos < CACHE_SLOTS {
        debug!("cache-dealloc placed {:p} in cache", c);
        let pos = (*s).cache.pos;
        (*s).cache.slots[pos] = c;
        (*s).cache.pos = pos + 1;
        c = null_mut();
    }
    (*s).lock.unlock();
    chunk_dealloc(c);
}

/// Drops one reference; on the last one, unlinks every block of the chunk
/// from the free list and retires the chunk. Entered with the state lock
/// held; always releases it.
unsafe fn chunk_free(s: *mut State, c: *mut Chunk) {
    if c.is_null() || (*c).ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
        (*s).lock.unlock();
        return;
    }
    for b in 0..BLOCKS_PER_ALLOC {
        let n = chunk_to_ptr(c, b, 0) as *mut ListNode;
        if !(*n).prev.is_null() && !(*n).next.is_null() {
            list_remove(n);
            (*n).prev = null_mut();
            (*n).next = null_mut();
        }
    }
    chunk_cache_or_dealloc(s, c);
}

/// Returns a chunk with `ref_count == 1` and clean header metadata, from
/// the cache when possible. Cache access needs the state lock; callers
/// already inside it pass `needs_lock = false`.
unsafe fn chunk_new(s: *mut State, needs_lock: bool) -> *mut Chunk {
    let mut c: *mut Chunk = null_mut();
    if needs_lock {
        (*s).lock.lock();
    }
    if (*s).cache.pos != 0 {
        let pos = (*s).cache.pos - 1;
        (*s).cache.pos = pos;
        c = (*s).cache.slots[pos];
        (*s).cache.slots[pos] = null_mut();
    }
    if needs_lock {
        (*s).lock.unlock();
    }
    if !c.is_null() {
        debug!("cache-alloc retrieved {:p} from cache", c);
        (*c).marker = 0;
        (*c).ref_count.store(1, Ordering::Relaxed);
        for b in 0..BLOCKS_PER_ALLOC {
            (*c).blocks[b].ref_count.store(0, Ordering::Relaxed);
            (*c).blocks[b].pos.store(0, Ordering::Relaxed);
        }
        return c;
    }

    // fresh pages arrive zeroed, only the reference needs setting
    c = os::sys_alloc(SYS_ALLOC_SIZE, SYS_ALLOC_LOG as u8) as *mut Chunk;
    if c.is_null() {
        return c;
    }
    stats::CHUNKS.increase(1);
    debug!("sys-alloc retrieved {:p} from system", c);
    (*c).ref_count.store(1, Ordering::Relaxed);
    c
}

/* -----------------------------------------------------------
  Block allocation / deallocation
----------------------------------------------------------- */

/// Scrubs a retired block. With `initialize-allocations` the used part is
/// zeroed (or the whole block when the cursor ran close to the end) so the
/// next user reads zeros; otherwise only the bytes that will hold the
/// free-list node are cleared.
unsafe fn block_reset_memory(c: *mut Chunk, b: usize) {
    #[cfg(feature = "initialize-allocations")]
    {
        let pos = (*c).blocks[b].pos.load(Ordering::Relaxed);
        if pos >= UNITS_PER_BLOCK as i32 - 4 {
            memset_aligned(chunk_to_ptr(c, b, 0), 0, BLOCK_SIZE);
        } else {
            memset_aligned(chunk_to_ptr(c, b, 0), 0, (pos as usize) << ALIGN_LOG);
        }
    }
    #[cfg(not(feature = "initialize-allocations"))]
    {
        memset_aligned(
            chunk_to_ptr(c, b, 0),
            0,
            (core::mem::size_of::<ListNode>() + (ALIGN_SIZE - 1)) & !(ALIGN_SIZE - 1),
        );
    }
    (*c).blocks[b].pos.store(0, Ordering::Relaxed);
}

/// Drops one reference on the block owning `p`; on the last one, resets
/// the block and threads it back onto the free list.
pub(crate) unsafe fn block_free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let c = chunk_of(p);
    let b = block_index_of(p);
    debug_assert!(
        (*c).blocks[b].ref_count.load(Ordering::Relaxed) as u32 <= UNITS_PER_BLOCK as u32 + 1,
        "block reference count corrupted, possible double free?"
    );
    debug_assert!(
        (*c).blocks[b].pos.load(Ordering::Relaxed) as u32 <= UNITS_PER_BLOCK as u32 + 1,
        "block allocation position corrupted, possible double free?"
    );
    if (*c).blocks[b].ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    block_reset_memory(c, b);

    let s = state_raw();
    (*s).lock.lock();
    let n = chunk_to_ptr(c, b, 0) as *mut ListNode;
    list_push(&mut (*s).blocks as *mut ListNode, n);
    // drops the chunk reference while still inside the lock
    chunk_free(s, c);
}

/// Returns a block with `ref_count == 1` and a zeroed cursor: the tail of
/// the free list when it has one, otherwise the first block of a fresh
/// chunk (whose remaining blocks go onto the list).
pub(crate) unsafe fn block_new() -> *mut u8 {
    let s = state_raw();
    let mut p: *mut u8 = null_mut();
    let mut c: *mut Chunk = null_mut();
    let mut b: usize = 0;

    (*s).lock.lock();

    let head = &mut (*s).blocks as *mut ListNode;
    if !list_is_empty(head) {
        let n = (*head).prev;
        list_remove(n);
        (*n).next = null_mut();
        (*n).prev = null_mut();
        p = n as *mut u8;
        c = chunk_of(p);
        b = block_index_of(p);
        (*c).ref_count.fetch_add(1, Ordering::Relaxed);
    } else {
        c = chunk_new(s, false);
        if !c.is_null() {
            p = chunk_to_ptr(c, 0, 0);
            for bi in 1..BLOCKS_PER_ALLOC {
                list_push(head, chunk_to_ptr(c, bi, 0) as *mut ListNode);
            }
            b = 0;
        }
    }

    (*s).lock.unlock();
    if p.is_null() {
        return p;
    }
    (*c).blocks[b].ref_count.store(1, Ordering::Relaxed);
    (*c).blocks[b].pos.store(0, Ordering::Relaxed);
    p
}

/* -----------------------------------------------------------
  Small slice allocation
----------------------------------------------------------- */

/// Bump-allocates `bytes` (rounded up to alignment units) from the calling
/// thread's arena. When `is_realloc` matches the arena's most recent slice
/// the cursor is extended in place and the same pointer returned. A full
/// block is replaced before the arena's reference on it is dropped, so the
/// chunk never bounces back to the system mid-rotation.
unsafe fn slice_new(s: *mut State, bytes: usize, is_realloc: *mut u8) -> *mut u8 {
    let mut last_pos: i32 = 0;
    let units = ((bytes + ALIGN_SIZE - 1) >> ALIGN_LOG) as i32;
    let a = arena_lock(s);

    if (*a).block.is_null() {
        (*a).block = block_new();
    } else if !is_realloc.is_null() {
        last_pos = (*a).last_pos;
    }
    loop {
        if (*a).block.is_null() {
            break;
        }
        let block = (*a).block;
        let c = chunk_of(block);
        let b = block_index_of(block);

        // sole holder of the block again? reclaim the used range
        if (*c).blocks[b].ref_count.fetch_add(1, Ordering::AcqRel) == 1
            && (*c).blocks[b].pos.load(Ordering::Relaxed) != 0
        {
            block_reset_memory(c, b);
        }

        // a lucky realloc: the pointer being grown is the latest slice and
        // the grown slice still fits the block
        if last_pos != 0
            && last_pos + units < UNITS_PER_BLOCK as i32
            && is_realloc == chunk_to_ptr(c, b, last_pos as usize)
        {
            (*c).blocks[b].pos.store(last_pos + units, Ordering::Relaxed);
            (*c).blocks[b].ref_count.fetch_sub(1, Ordering::Relaxed);
            arena_unlock(a);
            return is_realloc;
        }

        let pos = (*c).blocks[b].pos.load(Ordering::Relaxed);
        if pos + units < UNITS_PER_BLOCK as i32 {
            let p = chunk_to_ptr(c, b, pos as usize);
            (*a).last_pos = pos;
            (*c).blocks[b].pos.store(pos + units, Ordering::Relaxed);
            arena_unlock(a);
            return p;
        }

        // block is full: undo the reference taken above
        if !is_realloc.is_null() {
            (*c).blocks[b].ref_count.fetch_sub(1, Ordering::Relaxed);
        } else {
            block_free((*a).block);
        }
        (*a).block = block_new();
        last_pos = 0;
        // release the reference the arena held on the outgoing block
        block_free(block);
    }

    arena_unlock(a);
    set_errno(Errno(libc::ENOMEM));
    null_mut()
}

#[inline]
unsafe fn slice_free(p: *mut u8) {
    block_free(p);
}

/* -----------------------------------------------------------
  Big-block allocation
----------------------------------------------------------- */

#[cfg(feature = "big-alloc")]
unsafe fn big_block_reset_memory(b: *mut BigBlock) {
    #[cfg(feature = "initialize-allocations")]
    {
        let pos = (*b).pos.load(Ordering::Relaxed);
        if pos >= UNITS_PER_BIG_BLOCK as i32 - 10 {
            memset_aligned(b as *mut u8, 0, SYS_ALLOC_SIZE);
        } else {
            // header included, the caller re-stamps it
            memset_aligned(
                b as *mut u8,
                0,
                ((pos as usize) << ALIGN_LOG) + BIG_BLOCK_HEADER_SIZE,
            );
        }
    }
    #[cfg(not(feature = "initialize-allocations"))]
    {
        // scrub the chunk header (larger than the big-block header) and the
        // spots where block free-list nodes will live on reuse
        memset_aligned(b as *mut u8, 0, core::mem::size_of::<Chunk>());
        for i in 0..BLOCKS_PER_ALLOC {
            block_reset_memory(b as *mut Chunk, i);
        }
    }
    (*b).ref_count.store(1, Ordering::Relaxed);
}

/// Drops one reference; the last one scrubs the chunk and hands it to the
/// cache (or the system).
#[cfg(feature = "big-alloc")]
pub(crate) unsafe fn big_block_free(p: *mut u8) {
    let b = chunk_of(p) as *mut BigBlock;
    if b.is_null() || (*b).ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    debug!("chunk {:p} no longer used as big-block", b);
    big_block_reset_memory(b);
    let s = state_raw();
    (*s).lock.lock();
    chunk_cache_or_dealloc(s, b as *mut Chunk);
}

#[cfg(feature = "big-alloc")]
unsafe fn big_block_new(s: *mut State) -> *mut BigBlock {
    let b = chunk_new(s, true) as *mut BigBlock;
    if b.is_null() {
        set_errno(Errno(libc::ENOMEM));
        return b;
    }
    (*b).marker = BIG_BLOCK_MARKER;
    (*b).ref_count.store(1, Ordering::Relaxed);
    (*b).pos.store(0, Ordering::Relaxed);
    debug!("chunk {:p} used as big-block", b);
    b
}

/// The big-block analogue of `slice_new`: one shared bump region under one
/// lock. A full big block is swapped out under the lock and released
/// outside it.
#[cfg(feature = "big-alloc")]
unsafe fn big_slice_new(s: *mut State, bytes: usize, is_realloc: *mut u8) -> *mut u8 {
    let mut last_pos: i32 = 0;
    let units = ((bytes + ALIGN_SIZE - 1) >> ALIGN_LOG) as i32;
    loop {
        (*s).big_lock.lock();
        if (*s).big_block.is_null() {
            (*s).big_block = big_block_new(s);
        } else if !is_realloc.is_null() {
            last_pos = (*s).big_last_pos;
        }
        if (*s).big_block.is_null() {
            break;
        }
        let b = (*s).big_block;

        // sole holder again? reclaim the used range
        if (*b).ref_count.load(Ordering::Acquire) == 1 && (*b).pos.load(Ordering::Relaxed) != 0 {
            big_block_reset_memory(b);
            (*b).marker = BIG_BLOCK_MARKER;
        }

        // a lucky realloc, when the grown slice still fits
        if last_pos != 0
            && last_pos + units < UNITS_PER_BIG_BLOCK as i32
            && is_realloc == big_to_ptr(b, last_pos as usize)
        {
            (*s).big_last_pos = last_pos + units;
            (*s).big_lock.unlock();
            return is_realloc;
        }

        let pos = (*b).pos.load(Ordering::Relaxed);
        if pos + units < UNITS_PER_BIG_BLOCK as i32 {
            let p = big_to_ptr(b, pos as usize);
            // taken inside the lock so the reset above stays exclusive
            (*b).ref_count.fetch_add(1, Ordering::Relaxed);
            (*s).big_last_pos = pos;
            (*b).pos.store(pos + units, Ordering::Relaxed);
            (*s).big_lock.unlock();
            return p;
        }

        (*s).big_block = null_mut();
        (*s).big_last_pos = 0;
        (*s).big_lock.unlock();
        big_block_free(b as *mut u8);
    }
    (*s).big_lock.unlock();
    null_mut()
}

#[cfg(feature = "big-alloc")]
#[inline]
unsafe fn big_slice_free(p: *mut u8) {
    big_block_free(p);
}

/* -----------------------------------------------------------
  Routing
----------------------------------------------------------- */

#[inline]
fn route_to_sys(size: usize, is_realloc: bool) -> bool {
    #[cfg(feature = "big-alloc")]
    return (is_realloc && size > BIG_BLOCK_SIZE - (BIG_BLOCK_HEADER_SIZE << 1))
        || (!is_realloc && size > ALLOC_LIMIT);
    #[cfg(not(feature = "big-alloc"))]
    return (is_realloc && size > BLOCK_SIZE - (2 << ALIGN_LOG))
        || (!is_realloc && size > ALLOC_LIMIT);
}

/// The common allocation path. `is_realloc` carries the pointer being
/// reallocated (null for plain allocations) so the slice allocators can
/// attempt in-place growth.
unsafe fn malloc_core(size: usize, is_realloc: *mut u8) -> *mut u8 {
    if size == 0 {
        return zero_ptr();
    }
    stats::MALLOCS.increase(1);

    if route_to_sys(size, !is_realloc.is_null()) {
        debug!("unintended direct system allocation (slow): {} bytes", size);
        // the direct path counts its own allocation
        stats::FREES.increase(1);
        return mmap(size);
    }

    let s = state();
    if s.is_null() {
        stats::FREES.increase(1);
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }

    #[cfg(feature = "big-alloc")]
    {
        if (!is_realloc.is_null() && size > BLOCK_SIZE - (2 << ALIGN_LOG))
            || (is_realloc.is_null() && size > BLOCK_ALLOC_LIMIT)
        {
            let p = big_slice_new(s, size, is_realloc);
            if p.is_null() || p == is_realloc {
                // no new allocation was performed
                stats::FREES.increase(1);
            }
            return p;
        }
    }

    let p = slice_new(s, size, is_realloc);
    if p.is_null() || p == is_realloc {
        stats::FREES.increase(1);
    }
    p
}

/* -----------------------------------------------------------
  Public API
----------------------------------------------------------- */

/// Allocates `size` bytes aligned to the allocator alignment (16 bytes by
/// default).
///
/// Consecutive allocations from one thread tend to be adjacent. With the
/// `initialize-allocations` feature the memory is zeroed. Zero-byte
/// requests return the shared zero-length sentinel. Returns null with
/// `errno` set to `ENOMEM` on failure.
pub fn allocate(size: usize) -> *mut u8 {
    unsafe { malloc_core(size, null_mut()) }
}

/// Allocates a zeroed array of `count` elements of `size_per_unit` bytes.
///
/// Equivalent to `allocate(size_per_unit * count)` followed by zeroing;
/// the explicit zeroing is skipped when `initialize-allocations` already
/// guarantees it.
pub fn zero_allocate(size_per_unit: usize, count: usize) -> *mut u8 {
    let total = match size_per_unit.checked_mul(count) {
        Some(total) => total,
        None => {
            set_errno(Errno(libc::ENOMEM));
            return null_mut();
        }
    };
    #[cfg(feature = "initialize-allocations")]
    return allocate(total);
    #[cfg(not(feature = "initialize-allocations"))]
    {
        let len = match total.checked_add(ALIGN_SIZE - 1) {
            Some(len) => len & !(ALIGN_SIZE - 1),
            None => {
                set_errno(Errno(libc::ENOMEM));
                return null_mut();
            }
        };
        let p = allocate(len);
        if !p.is_null() && p != zero_ptr() {
            unsafe { memset_aligned(p, 0, len) };
        }
        return p;
    }
}

/// Allocates `size` bytes directly from the system, bypassing the pool.
///
/// Preferred for long-lived objects of a page or more: the memory never
/// occupies a pooled chunk, at the price of a system call. `free` releases
/// it like any other pointer.
pub fn mmap(size: usize) -> *mut u8 {
    if size == 0 {
        return allocate(0);
    }
    // header slack plus page rounding must not wrap
    if size > usize::max_value() - (ALIGN_SIZE << 1) - (1 << os::PAGE_SIZE_LOG) {
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }
    let bytes = os::round_to_pages(size + ALIGN_SIZE);
    if (bytes as u64) >> (31 + os::PAGE_SIZE_LOG) != 0 {
        // page count would overflow the marker
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }
    unsafe {
        let c = os::sys_alloc(bytes, SYS_ALLOC_LOG as u8) as *mut Chunk;
        if c.is_null() {
            set_errno(Errno(libc::ENOMEM));
            return null_mut();
        }
        stats::MALLOCS.increase(1);
        stats::CHUNKS.increase(1);
        (*c).marker = (bytes >> os::PAGE_SIZE_LOG) as u32;
        // the header stays the nearest preceding aligned address, so the
        // usual bit-mask recovery works on this tier too
        (c as *mut u8).add(ALIGN_SIZE)
    }
}

/// Frees a pointer previously returned by this allocator.
///
/// Null and the zero-length sentinel are ignored. Everything else is
/// dispatched by the owning chunk's marker.
///
/// # Safety
/// `ptr` must come from this allocator and must not be used afterwards.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() || ptr == zero_ptr() {
        return;
    }
    let c = chunk_of(ptr);
    if c.is_null() {
        error!("free called with a pointer owned by a null chunk");
        return;
    }
    stats::FREES.increase(1);

    #[cfg(feature = "big-alloc")]
    {
        if (*c).marker == BIG_BLOCK_MARKER {
            big_slice_free(ptr);
            return;
        }
    }

    if c as usize + ALIGN_SIZE == ptr as usize && (*c).marker != 0 {
        // direct system allocation; the marker holds the page count
        let bytes = ((*c).marker as usize) << os::PAGE_SIZE_LOG;
        os::sys_free(c as *mut u8, bytes);
        stats::CHUNKS.decrease(1);
        return;
    }

    slice_free(ptr);
}

/// Grows a direct system allocation through the system layer.
unsafe fn mmap_realloc(c: *mut Chunk, new_size: usize) -> *mut u8 {
    if new_size > usize::max_value() - (ALIGN_SIZE << 1) - (1 << os::PAGE_SIZE_LOG) {
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }
    let new_len = os::round_to_pages(new_size + ALIGN_SIZE);
    let old_len = ((*c).marker as usize) << os::PAGE_SIZE_LOG;
    let c = os::sys_realloc(c as *mut u8, old_len, new_len, SYS_ALLOC_LOG as u8) as *mut Chunk;
    if c.is_null() {
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }
    (*c).marker = (new_len >> os::PAGE_SIZE_LOG) as u32;
    (c as *mut u8).add(ALIGN_SIZE)
}

/// `reallocate2` with `copy_len == new_size`.
///
/// # Safety
/// `ptr` must come from this allocator (or be null / the sentinel).
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    reallocate2(ptr, new_size, new_size)
}

/// Resizes an allocation, preserving at most `copy_len` bytes.
///
/// The copy bound is clamped to the original region's capacity and to
/// `new_size`; bytes between the copied length and the next alignment
/// boundary of the destination are zeroed. When `ptr` was the most recent
/// slice of its arena (or of the big block) and there is room, the same
/// pointer is returned without copying. Null / the sentinel act as
/// `allocate`; `new_size == 0` acts as `free` and returns the sentinel.
///
/// # Safety
/// `ptr` must come from this allocator (or be null / the sentinel).
pub unsafe fn reallocate2(ptr: *mut u8, new_size: usize, mut copy_len: usize) -> *mut u8 {
    if new_size == 0 {
        free(ptr);
        return zero_ptr();
    }
    if ptr.is_null() || ptr == zero_ptr() {
        return malloc_core(new_size, null_mut());
    }

    let c = chunk_of(ptr);
    if c.is_null() {
        error!("reallocate called with a pointer owned by a null chunk");
        return null_mut();
    }

    // clamp the copy to what the original region can actually hold
    let is_big = cfg!(feature = "big-alloc") && (*c).marker == BIG_BLOCK_MARKER;
    let max_len = if is_big {
        (c as usize + SYS_ALLOC_SIZE) - ptr as usize
    } else if c as usize + ALIGN_SIZE == ptr as usize && (*c).marker != 0 {
        if new_size > ALLOC_LIMIT {
            return mmap_realloc(c, new_size);
        }
        // shrinking out of the direct tier into the pool
        new_size
    } else {
        let b = block_index_of(ptr);
        (chunk_to_ptr(c, b, 0) as usize + BLOCK_SIZE) - ptr as usize
    };
    if copy_len > max_len {
        copy_len = max_len;
    }
    if copy_len > new_size {
        copy_len = new_size;
    }

    let mem = malloc_core(new_size, ptr);
    if mem.is_null() || mem == ptr {
        return mem;
    }

    // a new slice later in the same block caps the copy at the gap
    if mem as usize > ptr as usize && ptr as usize + copy_len >= mem as usize {
        copy_len = mem as usize - ptr as usize;
    }

    memcpy_aligned(mem, ptr, (copy_len + (ALIGN_SIZE - 1)) & !(ALIGN_SIZE - 1));
    // zero the destination up to the alignment boundary
    let mut i = copy_len;
    while i & (ALIGN_SIZE - 1) != 0 {
        mem.add(i).write(0);
        i += 1;
    }

    free(ptr);
    mem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_requests_share_one_sentinel() {
        let a = allocate(0);
        let b = allocate(0);
        assert_eq!(a, b);
        assert_eq!(a as usize & (ALIGN_SIZE - 1), 0);
        unsafe {
            free(a);
            free(null_mut());
            // still intact after the no-op frees
            assert_eq!(allocate(0), a);
        }
    }

    #[test]
    fn slice_pointers_recover_their_chunk() {
        let p = allocate(64);
        assert!(!p.is_null());
        let c = chunk_of(p);
        assert_eq!(c as usize & (SYS_ALLOC_SIZE - 1), 0);
        assert!(block_index_of(p) < BLOCKS_PER_ALLOC);
        unsafe {
            assert_eq!((*c).marker, 0);
            free(p);
        }
    }

    #[cfg(feature = "big-alloc")]
    #[test]
    fn medium_requests_use_the_big_block() {
        let p = allocate(BLOCK_ALLOC_LIMIT + 1);
        assert!(!p.is_null());
        unsafe {
            let c = chunk_of(p);
            assert_eq!((*c).marker, BIG_BLOCK_MARKER);
            free(p);
        }
    }

    #[test]
    fn oversized_requests_map_directly() {
        let size = 8 * 1024 * 1024;
        let p = mmap(size);
        assert!(!p.is_null());
        unsafe {
            let c = chunk_of(p);
            assert_eq!(c as usize + ALIGN_SIZE, p as usize);
            let pages = os::round_to_pages(size + ALIGN_SIZE) >> os::PAGE_SIZE_LOG;
            assert_eq!((*c).marker, pages as u32);
            // usable end to end
            p.write(0xAB);
            p.add(size - 1).write(0xCD);
            free(p);
        }

        // `allocate` takes the same road above the pool limit
        let p = allocate(ALLOC_LIMIT + 1);
        assert!(!p.is_null());
        unsafe {
            let c = chunk_of(p);
            assert_eq!(c as usize + ALIGN_SIZE, p as usize);
            assert_ne!((*c).marker, 0);
            free(p);
        }
    }

    #[test]
    fn zero_allocate_is_zeroed_and_checks_overflow() {
        let p = zero_allocate(24, 7);
        assert!(!p.is_null());
        unsafe {
            for i in 0..(24 * 7) {
                assert_eq!(p.add(i).read(), 0);
            }
            free(p);
        }
        assert!(zero_allocate(usize::max_value(), 2).is_null());
    }
}
