//! Hierarchical MCS lock with priority deferral.
//!
//! Wraps an [`HmcsLock`] with a *wait/skip* queue that defers low-priority
//! acquirers: a thread whose priority is below the top takes a place in the
//! deferral queue and spins on its entry's flag until a releasing holder
//! observes the high side empty and waves the oldest deferred waiter
//! through. A woken entry remains in the queue as its owner's standing
//! pass; a below-top-priority thread re-checks that entry's flag on every
//! acquire and re-defers once a release has consumed it against an empty
//! high side. Raising a thread's priority to the top cancels (skips) its
//! entry.
//!
//! The queue itself is a spin-guarded FIFO; waiters spin on their own
//! entry's flag outside the guard, so the guard is only held for
//! constant-time bookkeeping on the cold path.
//!
//! Low-priority threads are starvation-free only under the assumption that
//! high-priority demand eventually ceases.

use core::sync::atomic::AtomicU32;
use std::collections::VecDeque;
use std::ptr;

use crate::error::Result;
use crate::hmcs::HmcsLock;
use crate::pr::{self, u32_ops};
use crate::spin::SpinGuarded;
use crate::topo::HmcsConfig;

const WAIT: u32 = 0;
const GO: u32 = 1;

#[repr(C)]
struct WEntry {
    flag: AtomicU32,
}

/// FIFO of flagged waiters with wake and skip.
struct WskipQueue {
    entries: SpinGuarded<VecDeque<*mut WEntry>>,
}

unsafe impl Send for WskipQueue {}
unsafe impl Sync for WskipQueue {}

impl WskipQueue {
    fn new() -> Self {
        Self {
            entries: SpinGuarded::new(VecDeque::new()),
        }
    }

    /// Wait for a pass through the entry recorded in `slot`, enqueueing a
    /// fresh entry first if the slot is empty. The sole entrant of an empty
    /// queue passes immediately; everyone else spins on their entry's flag
    /// until a wake reaches it.
    fn wait(&self, slot: &mut *mut WEntry) {
        if slot.is_null() {
            let entry = Box::into_raw(Box::new(WEntry {
                flag: AtomicU32::new(WAIT),
            }));
            {
                let mut entries = self.entries.acquire();
                if entries.is_empty() {
                    unsafe { u32_ops::store(&(*entry).flag, GO) };
                }
                entries.push_back(entry);
            }
            *slot = entry;
        }
        let entry = *slot;
        unsafe {
            while u32_ops::load(&(*entry).flag) == WAIT {
                pr::stall();
            }
        }
    }

    /// Wave the oldest still-waiting entry through. If `own` is non-null it
    /// is the caller's standing pass, consumed here.
    fn wake(&self, own: *mut WEntry) {
        let mut entries = self.entries.acquire();
        if !own.is_null() {
            if let Some(pos) = entries.iter().position(|&e| e == own) {
                entries.remove(pos);
                drop(unsafe { Box::from_raw(own) });
            }
        }
        for &entry in entries.iter() {
            if unsafe { u32_ops::load(&(*entry).flag) } == WAIT {
                unsafe { u32_ops::store(&(*entry).flag, GO) };
                break;
            }
        }
    }

    /// Remove the caller's entry without waking anyone; deferral cancelled.
    fn skip(&self, own: *mut WEntry) {
        let mut entries = self.entries.acquire();
        if let Some(pos) = entries.iter().position(|&e| e == own) {
            entries.remove(pos);
            drop(unsafe { Box::from_raw(own) });
        }
    }
}

impl Drop for WskipQueue {
    fn drop(&mut self) {
        let mut entries = self.entries.acquire();
        while let Some(entry) = entries.pop_front() {
            drop(unsafe { Box::from_raw(entry) });
        }
    }
}

/// Per-thread priority state for [`HmprLock`].
///
/// `priority` counts levels above the top; 0 is the highest priority.
pub struct HmprPnode {
    priority: u32,
    qnode: *mut WEntry,
}

impl HmprPnode {
    /// Create a state record at the given priority (0 = highest).
    pub fn new(priority: u32) -> Self {
        Self {
            priority,
            qnode: ptr::null_mut(),
        }
    }

    /// The current priority level.
    pub fn priority(&self) -> u32 {
        self.priority
    }
}

/// A hierarchical MCS lock with low-priority deferral.
pub struct HmprLock {
    lock: HmcsLock,
    waitq: WskipQueue,
}

impl HmprLock {
    /// Create with the hierarchy configured in the environment.
    pub fn new() -> Result<Self> {
        Self::with_config(&HmcsConfig::from_env())
    }

    /// Create over an explicit configuration.
    pub fn with_config(config: &HmcsConfig) -> Result<Self> {
        Ok(Self {
            lock: HmcsLock::with_config(config)?,
            waitq: WskipQueue::new(),
        })
    }

    /// Acquire. Callers below top priority re-check their deferral entry on
    /// every acquire; callers without an entry take their turn in the queue
    /// first. A pass obtained this way keeps serving until a release
    /// consumes it.
    pub fn acquire(&self, pnode: &mut HmprPnode) {
        if pnode.priority > 0 || pnode.qnode.is_null() {
            self.waitq.wait(&mut pnode.qnode);
        }
        self.lock.acquire();
    }

    /// Release. When the high side is empty, the caller's pass is consumed
    /// and the oldest deferred waiter is woken.
    pub fn release(&self, pnode: &mut HmprPnode) {
        if self.lock.no_waiters() {
            self.waitq.wake(pnode.qnode);
            pnode.qnode = ptr::null_mut();
        }
        self.lock.release();
    }

    /// Raise the caller's priority one level; reaching the top cancels any
    /// standing deferral entry.
    pub fn raise_prio(&self, pnode: &mut HmprPnode) {
        if pnode.priority > 0 {
            pnode.priority -= 1;
            if pnode.priority == 0 && !pnode.qnode.is_null() {
                self.waitq.skip(pnode.qnode);
                pnode.qnode = ptr::null_mut();
            }
        }
    }
}
