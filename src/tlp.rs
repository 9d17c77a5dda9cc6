//! Two-level priority lock, generic over the lock filling each slot.
//!
//! Same protocol as [`McspLock`](crate::mcsp::McspLock), but the concrete
//! lock for the high- and low-priority slots is chosen at compile time
//! through the [`SlotLock`] trait (ticket, MCS, or hierarchical MCS), so a
//! NUMA-aware high side can be paired with a cheap low side.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hmcs::HmcsLock;
use crate::mcs::McsLock;
use crate::ticket::TicketLock;

/// A context-less lock usable as a priority slot.
pub trait SlotLock {
    /// Acquire the slot lock.
    fn slot_acquire(&self);
    /// Release the slot lock.
    fn slot_release(&self);
    /// Whether the holder has no queued waiter. Only the high slot consults
    /// this.
    fn slot_no_waiters(&self) -> bool;
}

impl SlotLock for TicketLock {
    fn slot_acquire(&self) {
        self.acquire();
    }
    fn slot_release(&self) {
        self.release();
    }
    fn slot_no_waiters(&self) -> bool {
        self.no_waiters()
    }
}

impl SlotLock for McsLock {
    fn slot_acquire(&self) {
        self.acquire();
    }
    fn slot_release(&self) {
        self.release();
    }
    fn slot_no_waiters(&self) -> bool {
        self.no_waiters()
    }
}

impl SlotLock for HmcsLock {
    fn slot_acquire(&self) {
        self.acquire();
    }
    fn slot_release(&self) {
        self.release();
    }
    fn slot_no_waiters(&self) -> bool {
        self.no_waiters()
    }
}

/// A two-level priority lock over arbitrary slot locks.
pub struct TlpLock<H: SlotLock, L: SlotLock> {
    high_p: H,
    low_p: L,
    filter: TicketLock,
    go_straight: AtomicBool,
    low_p_acq: AtomicBool,
}

impl<H: SlotLock, L: SlotLock> TlpLock<H, L> {
    /// Compose a priority lock from already-constructed slot locks.
    pub fn new(high_p: H, low_p: L) -> Self {
        Self {
            high_p,
            low_p,
            filter: TicketLock::new(),
            go_straight: AtomicBool::new(false),
            low_p_acq: AtomicBool::new(false),
        }
    }

    /// Acquire with high priority.
    pub fn acquire(&self) {
        self.high_p.slot_acquire();
        if !self.go_straight.load(Ordering::Acquire) {
            self.filter.acquire();
            self.go_straight.store(true, Ordering::Release);
        }
    }

    /// Acquire with low priority.
    pub fn acquire_low(&self) {
        self.low_p.slot_acquire();
        self.filter.acquire();
        self.low_p_acq.store(true, Ordering::Release);
    }

    /// Release whichever acquire the caller performed last.
    pub fn release(&self) {
        if !self.low_p_acq.load(Ordering::Acquire) {
            if self.high_p.slot_no_waiters() {
                self.go_straight.store(false, Ordering::Release);
                self.filter.release();
            }
            self.high_p.slot_release();
        } else {
            self.low_p_acq.store(false, Ordering::Release);
            self.filter.release();
            self.low_p.slot_release();
        }
    }
}

/// Ticket lock in both slots.
pub type TlpTicket = TlpLock<TicketLock, TicketLock>;
/// MCS in both slots.
pub type TlpMcs = TlpLock<McsLock, McsLock>;
/// NUMA-aware high side over an MCS low side.
pub type TlpHmcsMcs = TlpLock<HmcsLock, McsLock>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_ticket_slots() {
        let lock = TlpTicket::new(TicketLock::new(), TicketLock::new());
        lock.acquire();
        lock.release();
        lock.acquire_low();
        lock.release();
    }

    #[test]
    fn test_mcs_slots() {
        let lock = TlpMcs::new(McsLock::new(), McsLock::new());
        lock.acquire();
        lock.release();
        lock.acquire_low();
        lock.release();
    }

    #[test]
    fn test_hmcs_high_slot() {
        let lock = TlpHmcsMcs::new(HmcsLock::new().unwrap(), McsLock::new());
        lock.acquire();
        lock.release();
        lock.acquire_low();
        lock.release();
    }

    #[test]
    fn test_mixed_mutual_exclusion() {
        const NITER: u64 = 20_000;
        let lock = Arc::new(TlpMcs::new(McsLock::new(), McsLock::new()));
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
