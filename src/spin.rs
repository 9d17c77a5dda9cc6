//! Spin-guarded cold-path state.
//!
//! The pool's global block reserve, the registry of pools, the thread
//! identifier table, and the priority deferral queue are all mutated rarely
//! and held briefly, so none of them warrants a queue lock. Each lives
//! behind a test-and-test-and-set flag: one CAS claims the flag, and
//! contended claimants watch it with plain loads, doubling the pause
//! between looks so a refill or a registry grow in flight is not slowed by
//! the waiters bouncing its cache line.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::pr;

const FREE: u32 = 0;
const HELD: u32 = 1;

/// Longest pause between looks at a held flag, in spin-hint iterations.
const PAUSE_CEILING: u32 = 128;

/// State claimed exclusively through a test-and-test-and-set flag.
#[repr(C)]
pub struct SpinGuarded<T> {
    flag: AtomicU32,
    state: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinGuarded<T> {}
unsafe impl<T: Send> Sync for SpinGuarded<T> {}

impl<T> SpinGuarded<T> {
    /// Wrap `state` with the flag clear.
    pub const fn new(state: T) -> Self {
        Self {
            flag: AtomicU32::new(FREE),
            state: UnsafeCell::new(state),
        }
    }

    /// Claim the flag, pausing with exponential backoff while it is held.
    pub fn acquire(&self) -> SpinStateRef<'_, T> {
        let mut pause = 1u32;
        while self
            .flag
            .compare_exchange_weak(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.flag.load(Ordering::Relaxed) == HELD {
                for _ in 0..pause {
                    pr::stall();
                }
                if pause < PAUSE_CEILING {
                    pause <<= 1;
                }
            }
        }
        SpinStateRef { owner: self }
    }

    /// Claim the flag only if it is clear right now.
    pub fn try_acquire(&self) -> Option<SpinStateRef<'_, T>> {
        if self
            .flag
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinStateRef { owner: self })
        } else {
            None
        }
    }

    /// Whether the flag is currently held.
    pub fn is_held(&self) -> bool {
        self.flag.load(Ordering::Relaxed) == HELD
    }
}

/// Exclusive view of the guarded state; clears the flag on drop.
pub struct SpinStateRef<'a, T> {
    owner: &'a SpinGuarded<T>,
}

impl<T> Deref for SpinStateRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.owner.state.get() }
    }
}

impl<T> DerefMut for SpinStateRef<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.owner.state.get() }
    }
}

impl<T> Drop for SpinStateRef<'_, T> {
    fn drop(&mut self) {
        self.owner.flag.store(FREE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let guarded = SpinGuarded::new(7u64);
        {
            let mut state = guarded.acquire();
            assert!(guarded.is_held());
            *state += 1;
        }
        assert!(!guarded.is_held());
        assert_eq!(*guarded.acquire(), 8);
    }

    #[test]
    fn test_try_acquire_while_held() {
        let guarded = SpinGuarded::new(());
        let held = guarded.acquire();
        assert!(guarded.try_acquire().is_none());
        drop(held);
        assert!(guarded.try_acquire().is_some());
    }

    #[test]
    fn test_contended_updates_are_exclusive() {
        use std::sync::Arc;

        let guarded = Arc::new(SpinGuarded::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let guarded = Arc::clone(&guarded);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *guarded.acquire() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*guarded.acquire(), 40_000);
    }
}
