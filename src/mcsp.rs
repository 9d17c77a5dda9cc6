//! Two-priority MCS lock pair.
//!
//! A high-priority MCS lock and a low-priority MCS lock share a ticket-lock
//! *filter*. Every holder must own the filter, but a run of high-priority
//! holders passes it along without releasing it (`go_straight`), so
//! low-priority acquirers only get through when the high side drains.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::mcs::{McsLock, McsNode};
use crate::ticket::TicketLock;

/// An MCS-based priority lock pair.
pub struct McspLock {
    high_p: McsLock,
    low_p: McsLock,
    filter: TicketLock,
    /// The current high-priority run still owns the filter.
    go_straight: AtomicBool,
    /// The most recent acquire was low-priority.
    low_p_acq: AtomicBool,
}

impl McspLock {
    /// Create a new unlocked pair.
    pub fn new() -> Self {
        Self {
            high_p: McsLock::new(),
            low_p: McsLock::new(),
            filter: TicketLock::new(),
            go_straight: AtomicBool::new(false),
            low_p_acq: AtomicBool::new(false),
        }
    }

    /// Acquire with high priority.
    pub fn acquire(&self) {
        self.high_p.acquire();
        if !self.go_straight.load(Ordering::Acquire) {
            self.filter.acquire();
            self.go_straight.store(true, Ordering::Release);
        }
    }

    /// Acquire with low priority.
    pub fn acquire_low(&self) {
        self.low_p.acquire();
        self.filter.acquire();
        self.low_p_acq.store(true, Ordering::Release);
    }

    /// Release whichever acquire the caller performed last.
    pub fn release(&self) {
        if !self.low_p_acq.load(Ordering::Acquire) {
            if self.high_p.no_waiters() {
                self.go_straight.store(false, Ordering::Release);
                self.filter.release();
            }
            self.high_p.release();
        } else {
            self.low_p_acq.store(false, Ordering::Release);
            self.filter.release();
            self.low_p.release();
        }
    }

    /// Contextful high-priority acquire.
    ///
    /// # Safety
    ///
    /// As [`McsLock::acquire_ctx`]: `node` must stay valid and unmoved until
    /// the matching [`release_ctx`](Self::release_ctx).
    pub unsafe fn acquire_ctx(&self, node: &McsNode) {
        self.high_p.acquire_ctx(node);
        if !self.go_straight.load(Ordering::Acquire) {
            self.filter.acquire();
            self.go_straight.store(true, Ordering::Release);
        }
    }

    /// Contextful low-priority acquire.
    ///
    /// # Safety
    ///
    /// As [`acquire_ctx`](Self::acquire_ctx).
    pub unsafe fn acquire_low_ctx(&self, node: &McsNode) {
        self.low_p.acquire_ctx(node);
        self.filter.acquire();
        self.low_p_acq.store(true, Ordering::Release);
    }

    /// Contextful release.
    ///
    /// # Safety
    ///
    /// `node` must be the node passed to the matching acquire.
    pub unsafe fn release_ctx(&self, node: &McsNode) {
        if !self.low_p_acq.load(Ordering::Acquire) {
            if self.high_p.no_waiters_ctx(node) {
                self.go_straight.store(false, Ordering::Release);
                self.filter.release();
            }
            self.high_p.release_ctx(node);
        } else {
            self.low_p_acq.store(false, Ordering::Release);
            self.filter.release();
            self.low_p.release_ctx(node);
        }
    }
}

impl Default for McspLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_high_acquire_release() {
        let lock = McspLock::new();
        lock.acquire();
        lock.release();
        lock.acquire();
        lock.release();
    }

    #[test]
    fn test_low_acquire_release() {
        let lock = McspLock::new();
        lock.acquire_low();
        lock.release();
    }

    #[test]
    fn test_alternating_classes() {
        let lock = McspLock::new();
        lock.acquire();
        lock.release();
        lock.acquire_low();
        lock.release();
        lock.acquire();
        lock.release();
    }

    // Both classes together must still be mutually exclusive.
    #[test]
    fn test_mixed_mutual_exclusion() {
        const NITER: u64 = 20_000;
        let lock = Arc::new(McspLock::new());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..NITER {
                        if i % 2 == 0 {
                            lock.acquire();
                        } else {
                            lock.acquire_low();
                        }
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
        assert_eq!(counter.load(Ordering::Relaxed), 4 * NITER);
    }
}
