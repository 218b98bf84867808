use core::sync::atomic::{AtomicI64, Ordering};

// Allocation statistics. The counters are cheap enough to keep in release
// builds; the cleanup path uses them for its leak report and tests use them
// to bound chunk retention.

pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        self.allocated.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn decrease(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        self.current.fetch_sub(amount, Ordering::Relaxed);
        self.freed.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// System reservations currently held (pool chunks and direct mappings).
pub static CHUNKS: StatCount = StatCount::new();
/// Calls that handed out memory.
pub static MALLOCS: StatCount = StatCount::new();
/// Calls that took memory back.
pub static FREES: StatCount = StatCount::new();

pub fn chunks_current() -> i64 {
    CHUNKS.current()
}

pub fn malloc_calls() -> i64 {
    MALLOCS.allocated()
}

pub fn free_calls() -> i64 {
    FREES.allocated()
}
