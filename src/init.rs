// Global state lifecycle.
//
// There is no life-before-main in Rust, so the state record is built
// lazily: every allocation entry point goes through `state()`, which is a
// single null check on the happy path. Teardown is explicit via
// `state_cleanup` and reports anything still held. `after_fork` makes the
// allocator usable in a child process by re-initializing every lock in
// place, leaving live allocations untouched.

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use log::{debug, error, warn};

#[cfg(feature = "big-alloc")]
use crate::alloc::big_block_free;
use crate::alloc::{block_free, block_new, chunk_dealloc};
use crate::internal::*;
use crate::lock::LOCK_NAME;
use crate::os;
use crate::stats;
use crate::types::*;

static STATE: AtomicPtr<State> = AtomicPtr::new(null_mut());
// serializes first-time setup; cleared by `after_fork` in case the fork
// happened mid-setup
static SETUP_LOCK: AtomicU32 = AtomicU32::new(0);

/// Current state pointer without triggering setup. Null before first use.
#[inline]
pub(crate) fn state_raw() -> *mut State {
    STATE.load(Ordering::Acquire)
}

/// State pointer, building the state on first use. Null only when the
/// state allocation itself failed.
#[inline]
pub(crate) fn state() -> *mut State {
    let s = STATE.load(Ordering::Acquire);
    if !s.is_null() {
        return s;
    }
    unsafe { state_setup() };
    STATE.load(Ordering::Acquire)
}

/// The arena table sits directly after the state record in the same
/// reservation.
#[inline]
pub(crate) unsafe fn arena_at(s: *mut State, index: usize) -> *mut Arena {
    debug_assert!(index < (*s).arena_count);
    ((s as *mut u8).add(size_of::<State>()) as *mut Arena).add(index)
}

fn state_size(arena_count: usize) -> usize {
    os::round_to_pages(size_of::<State>() + arena_count * size_of::<Arena>())
}

fn detect_arena_count() -> usize {
    if ARENA_COUNT > 0 {
        return ARENA_COUNT as usize;
    }
    let mut count = ARENA_COUNT_FALLBACK;
    #[cfg(not(windows))]
    {
        let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if cpus > 0 {
            count = cpus as usize;
        }
    }
    #[cfg(windows)]
    {
        let mut si: winapi::um::sysinfoapi::SYSTEM_INFO = Default::default();
        unsafe { winapi::um::sysinfoapi::GetSystemInfo(&mut si) };
        if si.dwNumberOfProcessors > 0 {
            count = si.dwNumberOfProcessors as usize;
        }
    }
    if count > ARENA_COUNT_MAX {
        count = ARENA_COUNT_MAX;
    }
    count
}

unsafe fn init_locks(s: *mut State) {
    (*s).lock.init();
    #[cfg(feature = "big-alloc")]
    (*s).big_lock.init();
    for i in 0..(*s).arena_count {
        (*arena_at(s, i)).lock.init();
    }
}

unsafe fn state_setup() {
    while SETUP_LOCK.swap(1, Ordering::Acquire) != 0 {
        std::thread::yield_now();
    }
    if !STATE.load(Ordering::Acquire).is_null() {
        SETUP_LOCK.store(0, Ordering::Release);
        return;
    }

    let arena_count = detect_arena_count();
    let size = state_size(arena_count);
    let s = os::sys_alloc(size, 0) as *mut State;
    if s.is_null() {
        // leave the state null; allocations will fail with ENOMEM
        error!("failed to allocate the allocator state ({} bytes)", size);
        SETUP_LOCK.store(0, Ordering::Release);
        return;
    }
    (*s).arena_count = arena_count;
    (*s).cache.pos = 0;
    #[cfg(feature = "big-alloc")]
    {
        (*s).big_block = null_mut();
        (*s).big_last_pos = 0;
    }
    list_init(&mut (*s).blocks as *mut ListNode);
    for i in 0..arena_count {
        let a = arena_at(s, i);
        (*a).block = null_mut();
        (*a).last_pos = 0;
    }
    init_locks(s);

    // publish before warmup: block_new reads the state through the global
    STATE.store(s, Ordering::Release);
    for i in 0..WARMUP.min(arena_count) {
        (*arena_at(s, i)).block = block_new();
    }
    SETUP_LOCK.store(0, Ordering::Release);
    debug!("allocator state initialized with {} arenas", arena_count);
}

/// Re-initializes every lock after a `fork`, without touching chunk or
/// block contents, so live allocations in the child stay valid. Performs
/// first-time setup when called before any allocation. Idempotent.
///
/// # Safety
/// Must only run while the calling thread is the sole thread of the
/// process, as is the case right after `fork`.
pub unsafe fn after_fork() {
    SETUP_LOCK.store(0, Ordering::Release);
    let s = state_raw();
    if s.is_null() {
        state_setup();
        return;
    }
    debug!("reinitializing allocator locks");
    init_locks(s);
}

/// Tears the allocator down: releases arena blocks, the big block and the
/// cache, reports leaked blocks and counter mismatches, and frees the
/// state record. Chunks with live allocations are reported, not freed.
///
/// # Safety
/// No other thread may use the allocator during or after the call;
/// outstanding pointers become invalid once their chunk is released.
pub unsafe fn state_cleanup() {
    let s = state_raw();
    if s.is_null() {
        return;
    }
    debug!("starting allocator state cleanup");

    // release the blocks held by the arenas
    for i in 0..(*s).arena_count {
        let a = arena_at(s, i);
        if (*a).lock.try_lock() {
            (*a).lock.unlock();
        } else {
            error!("cleanup called while some arenas are in use");
        }
        block_free((*a).block);
        (*a).block = null_mut();
        (*a).lock.init();
    }

    #[cfg(feature = "big-alloc")]
    {
        if !(*s).big_block.is_null() {
            let b = (*s).big_block;
            if (*b).ref_count.load(Ordering::Relaxed) > 1 {
                warn!(
                    "active big-block reference count error at {:p}; possible leaks",
                    b
                );
            }
            big_block_free(b as *mut u8);
            (*s).big_block = null_mut();
            (*s).big_lock.init();
        }
    }

    // drain the chunk cache
    while (*s).cache.pos != 0 {
        let pos = (*s).cache.pos - 1;
        (*s).cache.pos = pos;
        let c = (*s).cache.slots[pos];
        (*s).cache.slots[pos] = null_mut();
        chunk_dealloc(c);
    }

    // anything left on the free list belongs to a chunk with live blocks
    let head = &mut (*s).blocks as *mut ListNode;
    if !list_is_empty(head) {
        warn!("blocks left after cleanup - memory leaks?");
        let mut last_chunk: *mut Chunk = null_mut();
        let mut n = (*s).blocks.next;
        while n != head {
            let c = chunk_of(n as *mut u8);
            if c != last_chunk {
                last_chunk = c;
                warn!("leaked block(s) for chunk {:p}", c);
            }
            n = (*n).next;
        }
    }

    let size = state_size((*s).arena_count);
    STATE.store(null_mut(), Ordering::Release);
    os::sys_free(s as *mut u8, size);

    let chunks = stats::chunks_current();
    let mallocs = stats::malloc_calls();
    let frees = stats::free_calls();
    if chunks != 0 || mallocs != frees {
        error!(
            "possible leaks after cleanup: {} chunks held, {} allocations vs {} frees",
            chunks, mallocs, frees
        );
    }
}

/* -----------------------------------------------------------
  Configuration access
----------------------------------------------------------- */

/// Number of arenas, 0 before initialization.
pub fn arenas() -> usize {
    let s = state_raw();
    if s.is_null() {
        0
    } else {
        unsafe { (*s).arena_count }
    }
}

/// Usable bytes per arena block.
pub fn block_size() -> usize {
    BLOCK_SIZE
}

/// Largest request the pool serves at all; above this the allocator maps
/// directly from the system.
pub fn alloc_limit() -> usize {
    if BLOCK_ALLOC_LIMIT > ALLOC_LIMIT {
        BLOCK_ALLOC_LIMIT
    } else {
        ALLOC_LIMIT
    }
}

/// Largest request served from an arena block.
pub fn arena_alloc_limit() -> usize {
    BLOCK_ALLOC_LIMIT
}

/// Whether `reallocate` growth reads as zero rather than stale pool data.
pub fn realloc_is_safe() -> bool {
    cfg!(feature = "initialize-allocations")
}

/// Bytes obtained per system reservation.
pub fn sys_alloc_size() -> usize {
    SYS_ALLOC_SIZE
}

/// Depth of the retired-chunk cache.
pub fn cache_slots() -> usize {
    CACHE_SLOTS
}

/// Alignment of every returned pointer.
pub fn alignment() -> usize {
    ALIGN_SIZE
}

/// Log2 of [`alignment`].
pub fn alignment_log() -> usize {
    ALIGN_LOG
}

/* -----------------------------------------------------------
  State printing (debug helpers)
----------------------------------------------------------- */

/// Prints the allocator's data structure to stderr.
pub fn print_state() {
    let s = state_raw();
    if s.is_null() {
        eprintln!("allocator state: uninitialized");
        return;
    }
    unsafe {
        eprintln!("allocator state:");
        for i in 0..(*s).arena_count {
            let a = arena_at(s, i);
            eprintln!("\t* arena[{}] block: {:p}", i, (*a).block);
            if !(*a).block.is_null() {
                let c = chunk_of((*a).block);
                let b = block_index_of((*a).block);
                eprintln!(
                    "\t\tchunk-ref: {} ({:p})",
                    (*c).ref_count.load(Ordering::Relaxed),
                    c
                );
                eprintln!(
                    "\t\t- block[{}]-ref: {}\n\t\t- block[{}]-pos: {}",
                    b,
                    (*c).blocks[b].ref_count.load(Ordering::Relaxed),
                    b,
                    (*c).blocks[b].pos.load(Ordering::Relaxed)
                );
            }
        }
        #[cfg(feature = "big-alloc")]
        {
            eprintln!("\t---big allocations---");
            if !(*s).big_block.is_null() {
                let b = (*s).big_block;
                eprintln!(
                    "\t* big-block: {:p}\n\t\t ref: {}\n\t\t pos: {}",
                    b,
                    (*b).ref_count.load(Ordering::Relaxed),
                    (*b).pos.load(Ordering::Relaxed)
                );
            } else {
                eprintln!("\t* big-block: NULL");
            }
        }
        eprintln!("\t---caches---");
        for i in 0..CACHE_SLOTS {
            eprintln!("\t* cache[{}] chunk: {:p}", i, (*s).cache.slots[i]);
        }
    }
}

/// Prints the free-block list to stderr, most recently retired first.
pub fn print_free_block_list() {
    let s = state_raw();
    if s.is_null() {
        return;
    }
    unsafe {
        let head = &mut (*s).blocks as *mut ListNode;
        if (*head).prev == head {
            return;
        }
        eprintln!("allocator free block list:");
        let mut n = (*head).prev;
        let mut i = 0usize;
        while n != head {
            eprintln!("\t[{}] {:p}", i, n);
            i += 1;
            n = (*n).prev;
        }
    }
}

/// Prints the compile-time settings to stderr.
pub fn print_settings() {
    eprintln!("allocator configured with:");
    eprintln!("\t* allocation arenas:                        {} arenas", arenas());
    eprintln!("\t* system allocation size:                   {} bytes", SYS_ALLOC_SIZE);
    eprintln!("\t* system allocation overhead:               {} bytes", HEADER_SIZE);
    eprintln!("\t* cached system allocations (max):          {} units", CACHE_SLOTS);
    eprintln!("\t* memory block size:                        {} bytes", BLOCK_SIZE);
    eprintln!("\t* blocks per system allocation:             {} blocks", BLOCKS_PER_ALLOC);
    eprintln!("\t* allocation units per block:               {} units", UNITS_PER_BLOCK);
    eprintln!("\t* arena per-allocation limit:               {} bytes", BLOCK_ALLOC_LIMIT);
    eprintln!("\t* local per-allocation limit (before mmap): {} bytes", ALLOC_LIMIT);
    eprintln!("\t* zero-length pointer:                      {:p}", crate::alloc::zero_ptr());
    eprintln!(
        "\t* always initializes memory (zero-out):     {}",
        cfg!(feature = "initialize-allocations")
    );
    eprintln!("\t* {} locking system", LOCK_NAME);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_accessors_are_consistent() {
        assert_eq!(alignment(), 1 << alignment_log());
        assert!(arena_alloc_limit() <= alloc_limit());
        assert!(alloc_limit() < sys_alloc_size());
        assert!(block_size() > arena_alloc_limit());
        assert_eq!(realloc_is_safe(), cfg!(feature = "initialize-allocations"));
    }

    #[test]
    fn arena_table_is_populated_on_first_use() {
        let p = crate::alloc::allocate(1);
        assert!(!p.is_null());
        assert!(arenas() > 0);
        assert!(arenas() <= ARENA_COUNT_MAX);
        unsafe { crate::alloc::free(p) };
    }
}
