use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// A re-entrant monitor that also tracks how deep it is held, so code can
/// assert that it runs under (or outside of) the lock.
#[derive(Debug, Default)]
pub struct RecursiveLock {
    mutex: ReentrantMutex<()>,
    depth: AtomicUsize,
}

pub struct RecursiveLockGuard<'a> {
    lock: &'a RecursiveLock,
    guard: ReentrantMutexGuard<'a, ()>,
}

impl RecursiveLock {
    pub fn new() -> Self {
        Self {
            mutex: ReentrantMutex::new(()),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> RecursiveLockGuard<'_> {
        let guard = self.mutex.lock();
        self.depth.fetch_add(1, Ordering::Relaxed);
        RecursiveLockGuard { lock: self, guard }
    }

    pub fn try_lock(&self) -> Option<RecursiveLockGuard<'_>> {
        let guard = self.mutex.try_lock()?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Some(RecursiveLockGuard { lock: self, guard })
    }

    /// Held by any thread. Only meaningful for assertions.
    pub fn is_locked(&self) -> bool {
        self.depth() > 0
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.mutex.is_owned_by_current_thread()
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Runs `f` under the lock.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }
}

impl RecursiveLockGuard<'_> {
    /// Fully releases the lock for the duration of `f` and reacquires it
    /// afterwards, also when `f` unwinds. Only legal at depth 1: releasing an
    /// outer acquisition from an inner frame would break that frame.
    pub fn unlocked<R>(this: &mut Self, f: impl FnOnce() -> R) -> R {
        debug_assert_eq!(this.lock.depth(), 1, "temporary release of a nested lock");

        // Adds the depth back once the mutex is ours again, also on unwind.
        struct Restore<'a>(&'a RecursiveLock);
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.0.depth.fetch_add(1, Ordering::Relaxed);
            }
        }

        // The depth only changes while the mutex is held.
        this.lock.depth.fetch_sub(1, Ordering::Relaxed);
        let _restore = Restore(this.lock);
        ReentrantMutexGuard::unlocked(&mut this.guard, f)
    }
}

impl Drop for RecursiveLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.depth.fetch_sub(1, Ordering::Relaxed);
    }
}
