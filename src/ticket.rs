//! Ticket lock.
//!
//! Strict-FIFO spinlock: acquirers take a ticket with a fetch-add and spin
//! until the now-serving counter reaches it. The cheapest fair lock in the
//! crate and the filter used by the priority compositions.

use core::sync::atomic::AtomicU32;

use crossbeam_utils::CachePadded;

use crate::pr::{self, u32_ops};

/// A FIFO ticket lock.
///
/// Between [`acquire`](Self::acquire) and [`release`](Self::release) the
/// caller holds exclusive access. Releasing without holding is a contract
/// violation and leaves the lock in an undefined state.
#[repr(C)]
pub struct TicketLock {
    next_ticket: CachePadded<AtomicU32>,
    now_serving: CachePadded<AtomicU32>,
}

impl TicketLock {
    /// Create a new unlocked ticket lock.
    pub const fn new() -> Self {
        Self {
            next_ticket: CachePadded::new(AtomicU32::new(0)),
            now_serving: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Take a ticket and spin until it is served.
    #[inline]
    pub fn acquire(&self) {
        let my_ticket = self.next_ticket.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        while u32_ops::load(&self.now_serving) != my_ticket {
            pr::stall();
        }
    }

    /// Acquire only if the lock is free right now. Never spins.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let ticket = u32_ops::load_relaxed(&self.next_ticket);
        let serving = u32_ops::load(&self.now_serving);
        ticket == serving && u32_ops::cas(&self.next_ticket, ticket, ticket.wrapping_add(1))
    }

    /// Serve the next ticket.
    #[inline]
    pub fn release(&self) {
        self.now_serving.fetch_add(1, core::sync::atomic::Ordering::Release);
    }

    /// Whether no other thread holds or waits for the lock.
    ///
    /// Only meaningful when called by the current holder: exactly one ticket
    /// (the caller's) is outstanding.
    #[inline]
    pub fn no_waiters(&self) -> bool {
        let ticket = u32_ops::load_relaxed(&self.next_ticket);
        let serving = u32_ops::load_relaxed(&self.now_serving);
        ticket.wrapping_sub(serving) <= 1
    }

    /// Whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        u32_ops::load_relaxed(&self.next_ticket) != u32_ops::load_relaxed(&self.now_serving)
    }

    /// Acquire and return a guard that releases on drop.
    #[inline]
    pub fn lock(&self) -> TicketGuard<'_> {
        self.acquire();
        TicketGuard { lock: self }
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`TicketLock`].
pub struct TicketGuard<'a> {
    lock: &'a TicketLock,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let lock = TicketLock::new();
        lock.acquire();
        assert!(lock.is_locked());
        assert!(lock.no_waiters());
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_acquire() {
        let lock = TicketLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_guard() {
        let lock = TicketLock::new();
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    // 4 threads x 100_000 empty critical sections; terminates without
    // deadlock and the protected counter is exact.
    #[test]
    fn test_throughput_mutual_exclusion() {
        const NTHREADS: usize = 4;
        const NITER: u64 = 100_000;

        let lock = Arc::new(TicketLock::new());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..NTHREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..NITER {
                        lock.acquire();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        lock.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), NTHREADS as u64 * NITER);
    }
}
