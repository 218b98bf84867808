// Lock abstraction for the allocator state.
//
// The default is a spin lock with adaptive backoff; critical sections are a
// single slice allocation or block rotation, so spinning is usually cheaper
// than a kernel round trip. The `thread-mutex` feature selects a pthread
// mutex instead (POSIX only), which is the better choice when the arena
// count is decoupled from the CPU count and threads may wait a while.
//
// Locks live inside memory obtained straight from the system layer, so they
// are never constructed by value: `init` re-initializes a lock in place and
// doubles as the after-fork reset.

#[cfg(all(feature = "thread-mutex", unix))]
pub use self::mutex::Lock;
#[cfg(not(all(feature = "thread-mutex", unix)))]
pub use self::spin::Lock;

#[cfg(all(feature = "thread-mutex", unix))]
pub const LOCK_NAME: &str = "pthread_mutex";
#[cfg(not(all(feature = "thread-mutex", unix)))]
pub const LOCK_NAME: &str = "spin lock";

#[cfg(not(all(feature = "thread-mutex", unix)))]
mod spin {
    use core::sync::atomic::{AtomicU32, Ordering};

    // backoff ladder: busy spin, pause hint, yield, sleep
    #[inline]
    fn backoff(k: &mut u32) {
        if *k < 4 {
        } else if *k < 16 {
            core::hint::spin_loop();
        } else if *k < 32 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(std::time::Duration::from_millis(1));
            return;
        }
        *k += 1;
    }

    #[repr(C)]
    pub struct Lock {
        state: AtomicU32,
    }

    impl Lock {
        /// Re-initializes the lock in place, dropping any held state.
        pub unsafe fn init(&self) {
            self.state.store(0, Ordering::Release);
        }

        #[inline]
        pub fn try_lock(&self) -> bool {
            self.state.swap(1, Ordering::Acquire) == 0
        }

        pub fn lock(&self) {
            let mut k = 0u32;
            while self.state.swap(1, Ordering::Acquire) != 0 {
                backoff(&mut k);
            }
        }

        #[inline]
        pub fn unlock(&self) {
            self.state.store(0, Ordering::Release);
        }
    }
}

#[cfg(all(feature = "thread-mutex", unix))]
mod mutex {
    use core::cell::UnsafeCell;

    use log::error;

    #[repr(C)]
    pub struct Lock {
        inner: UnsafeCell<libc::pthread_mutex_t>,
    }

    unsafe impl Send for Lock {}
    unsafe impl Sync for Lock {}

    impl Lock {
        /// Re-initializes the mutex in place, dropping any held state.
        /// Required after `fork` and before first use of raw state memory.
        pub unsafe fn init(&self) {
            core::ptr::write(self.inner.get(), libc::PTHREAD_MUTEX_INITIALIZER);
        }

        #[inline]
        pub fn try_lock(&self) -> bool {
            unsafe { libc::pthread_mutex_trylock(self.inner.get()) == 0 }
        }

        #[inline]
        pub fn lock(&self) {
            unsafe {
                libc::pthread_mutex_lock(self.inner.get());
            }
        }

        pub fn unlock(&self) {
            let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
            if rc != 0 {
                error!("couldn't release mutex, error ({}): {}", rc, errno::Errno(rc));
            }
        }
    }
}
