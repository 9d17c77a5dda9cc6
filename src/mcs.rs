//! MCS queue lock.
//!
//! Acquirers swap themselves into a shared tail pointer and spin on a word
//! inside their own queue node, so each waiter spins on local memory and
//! hand-off is a single remote store. FIFO in swap order.
//!
//! Two surfaces are provided:
//!
//! - a *context-less* API where the lock owns one node per bound thread,
//!   indexed by [`topo::thread_id`]; this is the safe, ergonomic surface
//! - a *contextful* API where the caller supplies the node; the node must
//!   outlive the acquire/release pair, which the borrow checker cannot
//!   enforce across the two calls, so this surface is `unsafe`
//!
//! [`CsvMcsLock`] is a context-saving variant: acquire records the holder's
//! node inside the lock, so release takes no arguments at all.

use core::cell::Cell;
use core::sync::atomic::{AtomicPtr, AtomicU32};
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::pr::{self, ptr_ops, u32_ops};
use crate::topo;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A queue node. One per thread per lock engagement; owned by the thread
/// currently between acquire and release.
#[repr(C)]
pub struct McsNode {
    status: AtomicU32,
    next: AtomicPtr<McsNode>,
}

impl McsNode {
    /// Create a node ready for an acquire.
    pub const fn new() -> Self {
        Self {
            status: AtomicU32::new(UNLOCKED),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

/// An MCS queue lock.
pub struct McsLock {
    tail: CachePadded<AtomicPtr<McsNode>>,
    local_nodes: Box<[CachePadded<McsNode>]>,
}

unsafe impl Send for McsLock {}
unsafe impl Sync for McsLock {}

impl McsLock {
    /// Create a new unlocked MCS lock with a node table covering every
    /// bindable thread.
    pub fn new() -> Self {
        let max_threads = topo::max_threads();
        let local_nodes = (0..max_threads)
            .map(|_| CachePadded::new(McsNode::new()))
            .collect();
        Self {
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            local_nodes,
        }
    }

    /// Acquire with a caller-supplied node.
    ///
    /// # Safety
    ///
    /// `node` must remain valid and unmoved until the matching
    /// [`release_ctx`](Self::release_ctx) returns, and must not be used with
    /// any other lock in between.
    #[inline]
    pub unsafe fn acquire_ctx(&self, node: &McsNode) {
        ptr_ops::store(&node.next, ptr::null_mut());
        let me = node as *const McsNode as *mut McsNode;
        let pred = ptr_ops::swap(&self.tail, me);
        if !pred.is_null() {
            u32_ops::store(&node.status, LOCKED);
            ptr_ops::store(&(*pred).next, me);
            while u32_ops::load(&node.status) != UNLOCKED {
                pr::stall();
            }
        }
    }

    /// Try to acquire with a caller-supplied node; a single CAS, no spin.
    ///
    /// # Safety
    ///
    /// As [`acquire_ctx`](Self::acquire_ctx), when `true` is returned.
    #[inline]
    pub unsafe fn try_acquire_ctx(&self, node: &McsNode) -> bool {
        ptr_ops::store(&node.next, ptr::null_mut());
        let me = node as *const McsNode as *mut McsNode;
        ptr_ops::cas(&self.tail, ptr::null_mut(), me)
    }

    /// Release with the node used to acquire.
    ///
    /// # Safety
    ///
    /// `node` must be the node passed to the matching acquire, and the
    /// caller must hold the lock.
    #[inline]
    pub unsafe fn release_ctx(&self, node: &McsNode) {
        let me = node as *const McsNode as *mut McsNode;
        if ptr_ops::load(&node.next).is_null() {
            if ptr_ops::cas(&self.tail, me, ptr::null_mut()) {
                return;
            }
            // A successor swapped in but has not linked yet.
            while ptr_ops::load(&node.next).is_null() {
                pr::stall();
            }
        }
        let succ = ptr_ops::load(&node.next);
        u32_ops::store(&(*succ).status, UNLOCKED);
    }

    /// Whether the holder's node has no linked successor.
    ///
    /// # Safety
    ///
    /// `node` must be the node used for the current acquire.
    #[inline]
    pub unsafe fn no_waiters_ctx(&self, node: &McsNode) -> bool {
        ptr_ops::load(&node.next).is_null()
    }

    #[inline]
    fn my_node(&self) -> &McsNode {
        &self.local_nodes[topo::thread_id()]
    }

    /// Acquire using the calling thread's table node.
    #[inline]
    pub fn acquire(&self) {
        // The table node is owned by the lock and never moves.
        unsafe { self.acquire_ctx(self.my_node()) }
    }

    /// Try to acquire using the calling thread's table node.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        unsafe { self.try_acquire_ctx(self.my_node()) }
    }

    /// Release an acquire made through [`acquire`](Self::acquire).
    #[inline]
    pub fn release(&self) {
        unsafe { self.release_ctx(self.my_node()) }
    }

    /// Whether the calling holder has no queued successor.
    #[inline]
    pub fn no_waiters(&self) -> bool {
        unsafe { self.no_waiters_ctx(self.my_node()) }
    }

    /// Acquire and return a guard that releases on drop (context-less).
    #[inline]
    pub fn lock(&self) -> McsGuard<'_> {
        self.acquire();
        McsGuard { lock: self }
    }
}

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for the context-less API of [`McsLock`].
pub struct McsGuard<'a> {
    lock: &'a McsLock,
}

impl Drop for McsGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A context-saving MCS lock.
///
/// Identical protocol to [`McsLock`], but the lock remembers the holder's
/// queue node, so release needs no context. This suits callers whose
/// acquire and release sites are in different scopes and cannot thread the
/// node between them.
pub struct CsvMcsLock {
    tail: CachePadded<AtomicPtr<McsNode>>,
    /// The current holder's node; written only between acquire and release.
    cur_ctx: Cell<*mut McsNode>,
}

unsafe impl Send for CsvMcsLock {}
unsafe impl Sync for CsvMcsLock {}

impl CsvMcsLock {
    /// Create a new unlocked lock.
    pub fn new() -> Self {
        Self {
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            cur_ctx: Cell::new(ptr::null_mut()),
        }
    }

    /// Acquire with `node` and save it as the current context.
    ///
    /// # Safety
    ///
    /// `node` must remain valid and unmoved until the matching
    /// [`release`](Self::release) returns.
    pub unsafe fn acquire_ctx(&self, node: &McsNode) {
        ptr_ops::store(&node.next, ptr::null_mut());
        let me = node as *const McsNode as *mut McsNode;
        let pred = ptr_ops::swap(&self.tail, me);
        if !pred.is_null() {
            u32_ops::store(&node.status, LOCKED);
            ptr_ops::store(&(*pred).next, me);
            while u32_ops::load(&node.status) != UNLOCKED {
                pr::stall();
            }
        }
        self.cur_ctx.set(me);
    }

    /// Release using the saved context.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock through a prior
    /// [`acquire_ctx`](Self::acquire_ctx).
    pub unsafe fn release(&self) {
        let node = self.cur_ctx.get();
        self.cur_ctx.set(ptr::null_mut());
        if ptr_ops::load(&(*node).next).is_null() {
            if ptr_ops::cas(&self.tail, node, ptr::null_mut()) {
                return;
            }
            while ptr_ops::load(&(*node).next).is_null() {
                pr::stall();
            }
        }
        let succ = ptr_ops::load(&(*node).next);
        u32_ops::store(&(*succ).status, UNLOCKED);
    }
}

impl Default for CsvMcsLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_uncontended() {
        let lock = McsLock::new();
        lock.acquire();
        assert!(lock.no_waiters());
        lock.release();
    }

    #[test]
    fn test_try_acquire() {
        let lock = McsLock::new();
        assert!(lock.try_acquire());
        let other = McsNode::new();
        assert!(!unsafe { lock.try_acquire_ctx(&other) });
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_contextful_pair() {
        let lock = McsLock::new();
        let node = McsNode::new();
        unsafe {
            lock.acquire_ctx(&node);
            assert!(lock.no_waiters_ctx(&node));
            lock.release_ctx(&node);
        }
    }

    #[test]
    fn test_mutual_exclusion() {
        const NTHREADS: usize = 4;
        const NITER: u64 = 50_000;

        let lock = Arc::new(McsLock::new());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..NTHREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..NITER {
                        let _guard = lock.lock();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), NTHREADS as u64 * NITER);
    }

    #[test]
    fn test_context_saving_release_without_node() {
        let lock = CsvMcsLock::new();
        let node = McsNode::new();
        unsafe {
            lock.acquire_ctx(&node);
            lock.release();
            lock.acquire_ctx(&node);
            lock.release();
        }
    }

    #[test]
    fn test_context_saving_mutual_exclusion() {
        const NTHREADS: usize = 4;
        const NITER: u64 = 20_000;

        let lock = Arc::new(CsvMcsLock::new());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..NTHREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    let node = McsNode::new();
                    for _ in 0..NITER {
                        unsafe {
                            lock.acquire_ctx(&node);
                            let v = counter.load(Ordering::Relaxed);
                            counter.store(v + 1, Ordering::Relaxed);
                            lock.release();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), NTHREADS as u64 * NITER);
    }

    #[test]
    fn test_handoff_unblocks_waiter() {
        let lock = Arc::new(McsLock::new());
        lock.acquire();

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.acquire();
                lock.release();
            })
        };
        // Give the waiter time to queue behind us, then hand off.
        while lock.no_waiters() {
            std::thread::yield_now();
        }
        lock.release();
        waiter.join().unwrap();
    }
}
