//! Load Lock
//!
//! A single global lock serializes load/unload transactions across all
//! threads. It is re-entrant per thread so an initializer running inside a
//! transaction can open a nested one; the re-entry contract is explicit
//! (owner token plus recursion depth), not an implicit property of the
//! lock.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Identifies the thread attempting to take the load lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadToken(pub u64);

/// Thread-identity capability (the OS thread subsystem).
///
/// Tokens must be stable for a thread's lifetime, unique across live
/// threads, and never `u64::MAX` (reserved for "unowned").
pub trait ThreadIdSource: Send + Sync {
    /// Token of the calling thread.
    fn current_thread(&self) -> ThreadToken;
}

/// Thread-identity source for single-threaded hosts.
pub struct SingleThread;

impl ThreadIdSource for SingleThread {
    fn current_thread(&self) -> ThreadToken {
        ThreadToken(0)
    }
}

const UNOWNED: u64 = u64::MAX;

/// Re-entrant spin lock keyed by thread token.
pub struct ReentrantLock {
    owner: AtomicU64,
    depth: AtomicUsize,
}

impl ReentrantLock {
    /// Create an unowned lock.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(UNOWNED),
            depth: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock for `token`, spinning if another thread owns it.
    ///
    /// Re-acquisition by the owning thread increments the recursion depth
    /// and returns immediately.
    pub fn acquire(&self, token: ThreadToken) -> LockGuard<'_> {
        debug_assert_ne!(token.0, UNOWNED);

        if self.owner.load(Ordering::Acquire) == token.0 {
            // Only the owner can observe itself as owner; depth is
            // thread-private while owned.
            self.depth.fetch_add(1, Ordering::Relaxed);
            return LockGuard { lock: self };
        }

        while self
            .owner
            .compare_exchange_weak(UNOWNED, token.0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.depth.store(1, Ordering::Relaxed);
        LockGuard { lock: self }
    }

    /// Current recursion depth (0 when unowned).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let remaining = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            self.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one level of the lock on drop.
pub struct LockGuard<'a> {
    lock: &'a ReentrantLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
