use core::mem::size_of;
use core::sync::atomic::AtomicI32;

use crate::lock::Lock;

// ------------------------------------------------------
// Main tuning parameters
//
// All sizes are powers of two. Chunks are aligned to their
// own size so any interior pointer can be masked back to the
// chunk header.
// ------------------------------------------------------

/// Log2 of the allocation alignment. Must be >= 3 and <= 10.
pub const ALIGN_LOG: usize = 4;

/// Alignment of every pointer returned to callers (16 bytes).
pub const ALIGN_SIZE: usize = 1 << ALIGN_LOG;

/// Log2 of a single system reservation ("chunk"). Limited to 17..=24.
pub const SYS_ALLOC_LOG: usize = 21;

/// Bytes consumed per system reservation (2 MiB).
pub const SYS_ALLOC_SIZE: usize = 1 << SYS_ALLOC_LOG;

/// Log2 of the number of blocks a chunk is carved into. Range 0..=5.
pub const BLOCKS_PER_ALLOC_LOG: usize = 2;

/// Blocks per chunk.
pub const BLOCKS_PER_ALLOC: usize = 1 << BLOCKS_PER_ALLOC_LOG;

/// Retired chunks kept around instead of being returned to the system.
pub const CACHE_SLOTS: usize = 4;

/// Fixed arena count when positive; negative derives it from the CPU count.
pub const ARENA_COUNT: i32 = -1;

/// Arena count used when CPU detection fails.
pub const ARENA_COUNT_FALLBACK: usize = 8;

/// Upper bound on the derived arena count.
pub const ARENA_COUNT_MAX: usize = 32;

/// Number of arenas pre-populated with a block at state setup.
pub const WARMUP: usize = 0;

// ------------------------------------------------------
// Derived constants
// ------------------------------------------------------

/// Largest request served from an arena block.
pub const BLOCK_ALLOC_LIMIT: usize = SYS_ALLOC_SIZE >> (BLOCKS_PER_ALLOC_LOG + 2);

/// Largest request served from the shared big block.
pub const BIG_ALLOC_LIMIT: usize = SYS_ALLOC_SIZE
    >> (if BLOCKS_PER_ALLOC_LOG > 3 {
        3
    } else {
        BLOCKS_PER_ALLOC_LOG
    });

/// Largest request served by the pool at all; anything above goes
/// straight to the system.
#[cfg(feature = "big-alloc")]
pub const ALLOC_LIMIT: usize = BIG_ALLOC_LIMIT;
#[cfg(not(feature = "big-alloc"))]
pub const ALLOC_LIMIT: usize = BLOCK_ALLOC_LIMIT;

/// Chunk header size, rounded up to the allocation alignment.
pub const HEADER_SIZE: usize = (size_of::<Chunk>() + (ALIGN_SIZE - 1)) & !(ALIGN_SIZE - 1);

/// Usable bytes per block.
pub const BLOCK_SIZE: usize =
    ((SYS_ALLOC_SIZE - HEADER_SIZE) / BLOCKS_PER_ALLOC) & !(ALIGN_SIZE - 1);

/// Alignment units per block; the bump cursor counts in these.
pub const UNITS_PER_BLOCK: usize = BLOCK_SIZE / ALIGN_SIZE;

/// Big-block header size, rounded up to the allocation alignment.
pub const BIG_BLOCK_HEADER_SIZE: usize =
    (size_of::<BigBlock>() + (ALIGN_SIZE - 1)) & !(ALIGN_SIZE - 1);

/// Usable bytes in a chunk used as a single big block.
pub const BIG_BLOCK_SIZE: usize = SYS_ALLOC_SIZE - BIG_BLOCK_HEADER_SIZE;

/// Alignment units per big block.
pub const UNITS_PER_BIG_BLOCK: usize = BIG_BLOCK_SIZE / ALIGN_SIZE;

/// Marker stamped into a chunk header while it serves as a big block.
/// Regular chunks carry 0; direct system allocations carry their page count.
pub const BIG_BLOCK_MARKER: u32 = !0u32 << 2;

// ------------------------------------------------------
// Chunk / block headers
// ------------------------------------------------------

/// Per-block metadata, stored in the owning chunk's header.
///
/// `ref_count` counts live slices plus one for the arena that holds the
/// block; `pos` is the bump cursor in alignment units.
#[repr(C)]
pub struct BlockMeta {
    pub ref_count: AtomicI32,
    pub pos: AtomicI32,
}

/// Header at the base of every system reservation.
#[repr(C)]
pub struct Chunk {
    pub marker: u32,
    pub ref_count: AtomicI32,
    pub blocks: [BlockMeta; BLOCKS_PER_ALLOC],
}

/// Overlays the chunk header when a whole chunk is used as one bump
/// region. `marker` and `ref_count` must line up with `Chunk`.
#[repr(C)]
pub struct BigBlock {
    pub marker: u32,
    pub ref_count: AtomicI32,
    pub pos: AtomicI32,
}

/// Intrusive node threaded through the payload of a free block.
/// Overwritten by user data the moment the block becomes active.
#[repr(C)]
pub struct ListNode {
    pub prev: *mut ListNode,
    pub next: *mut ListNode,
}

// ------------------------------------------------------
// Arena and global state
// ------------------------------------------------------

/// A concurrency shard: one lock, one active block, and the cursor of the
/// most recent slice (for the in-place reallocation fast path).
#[repr(C)]
pub struct Arena {
    pub block: *mut u8,
    pub last_pos: i32,
    pub lock: Lock,
}

/// Bounded LIFO of retired chunks, guarded by the state lock.
#[repr(C)]
pub struct ChunkCache {
    pub slots: [*mut Chunk; CACHE_SLOTS],
    pub pos: usize,
}

/// Process-wide allocator state. Allocated from the system layer with the
/// arena table appended directly after it in the same reservation.
#[repr(C)]
pub struct State {
    pub cache: ChunkCache,
    #[cfg(feature = "big-alloc")]
    pub big_block: *mut BigBlock,
    #[cfg(feature = "big-alloc")]
    pub big_last_pos: i32,
    #[cfg(feature = "big-alloc")]
    pub big_lock: Lock,
    /// Guards the free-block list, the chunk cache and chunk teardown.
    pub lock: Lock,
    /// Free-block list head (circular, doubly linked).
    pub blocks: ListNode,
    pub arena_count: usize,
    // `arena_count` arenas follow in the same allocation
}

// the big-block header must overlay the chunk header
const _: () = assert!(size_of::<BigBlock>() <= size_of::<Chunk>());
