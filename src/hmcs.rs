//! Hierarchical MCS lock with cohort passing and an uncontended fast path.
//!
//! One MCS queue per node of an immutable NUMA tree. A thread enqueues at
//! its leaf-level node; the first arrival of a cohort climbs and acquires
//! the parent on behalf of the whole group. Releases prefer the local
//! successor, passing an incremented cohort count, until the per-level
//! threshold is consumed; then the parent is released and a late local
//! successor is told to climb itself. Passing within a cohort is one local
//! store, so cross-socket traffic is paid once per cohort instead of once
//! per critical section.
//!
//! Status word of a queue node while engaged with this lock:
//!
//! - `WAIT`: spinning
//! - `COHORT_START` (1): lock held, cohort begins at this thread
//! - any value below `ACQUIRE_PARENT`: lock held, value is the cohort count
//! - `ACQUIRE_PARENT`: predecessor ended the cohort; climb to the parent

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicU32};
use std::ptr;

use crossbeam_utils::CachePadded;
use log::debug;

use crate::error::{Error, Result};
use crate::pr::{self, ptr_ops, u32_ops};
use crate::topo::{self, Hierarchy, HmcsConfig};

const WAIT: u32 = 0xffff_ffff;
const COHORT_START: u32 = 0x1;
const ACQUIRE_PARENT: u32 = 0xcfff_fffc;

#[repr(C)]
struct Qnode {
    status: AtomicU32,
    next: AtomicPtr<Qnode>,
}

impl Qnode {
    const fn new() -> Self {
        Self {
            status: AtomicU32::new(WAIT),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    fn reuse(&self) {
        u32_ops::store(&self.status, WAIT);
        ptr_ops::store(&self.next, ptr::null_mut());
    }
}

/// One node of the hierarchy tree: an MCS tail, the per-level threshold, the
/// parent link, and an embedded queue node representing this subtree at the
/// parent level.
#[repr(C)]
struct HNode {
    threshold: u32,
    parent: *mut HNode,
    lock: AtomicPtr<Qnode>,
    node: Qnode,
}

impl HNode {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            parent: ptr::null_mut(),
            lock: AtomicPtr::new(ptr::null_mut()),
            node: Qnode::new(),
        }
    }
}

/// Per-thread view of the tree: the leaf-level node, the cached root, the
/// personal queue node, and whether the last acquire bypassed the hierarchy.
struct Leaf {
    cur_node: *mut HNode,
    root_node: *mut HNode,
    qnode: Qnode,
    took_fast_path: bool,
}

/// A hierarchical MCS lock.
///
/// Context-less: each bound thread has a fixed leaf, so acquire and release
/// need no caller-supplied state.
pub struct HmcsLock {
    levels: usize,
    // Tree nodes, level by level, innermost first. Boxed for stable
    // addresses; parent pointers are fixed at construction. Held only for
    // ownership: all traffic goes through raw pointers from the leaves.
    _tree: Vec<Vec<Box<CachePadded<HNode>>>>,
    leaves: Box<[CachePadded<UnsafeCell<Leaf>>]>,
}

unsafe impl Send for HmcsLock {}
unsafe impl Sync for HmcsLock {}

impl HmcsLock {
    /// Create a lock over the hierarchy configured in the environment.
    pub fn new() -> Result<Self> {
        Self::with_config(&HmcsConfig::from_env())
    }

    /// Create a lock over the hierarchy described by `config`.
    pub fn with_config(config: &HmcsConfig) -> Result<Self> {
        let hierarchy = Hierarchy::detect(config, topo::max_threads())?;
        Self::with_hierarchy(&hierarchy, config.threshold)
    }

    /// Create a lock over an explicit hierarchy.
    ///
    /// The hierarchy's thread bound must equal [`topo::max_threads`], since
    /// leaves are indexed by bound thread id.
    pub fn with_hierarchy(hierarchy: &Hierarchy, threshold: u32) -> Result<Self> {
        let max_threads = hierarchy.max_threads();
        if max_threads != topo::max_threads() {
            return Err(Error::InvalidTopology(
                "hierarchy thread bound must match the adapter's",
            ));
        }
        let levels = hierarchy.levels();

        let mut tree: Vec<Vec<Box<CachePadded<HNode>>>> = Vec::with_capacity(levels);
        for level in 0..levels {
            let count = max_threads / hierarchy.participants_at(level);
            let nodes = (0..count)
                .map(|_| Box::new(CachePadded::new(HNode::new(threshold))))
                .collect::<Vec<_>>();
            tree.push(nodes);
        }

        // Wire parents: the group of `participants_at(l + 1) /
        // participants_at(l)` nodes at level l shares one parent at l + 1.
        // Fixed here, never mutated again.
        for level in 0..levels - 1 {
            let fanout = hierarchy.participants_at(level + 1) / hierarchy.participants_at(level);
            let parents: Vec<*mut HNode> = tree[level + 1]
                .iter()
                .map(|p| {
                    let p: &HNode = p;
                    p as *const HNode as *mut HNode
                })
                .collect();
            for (i, node) in tree[level].iter_mut().enumerate() {
                node.parent = parents[i / fanout];
            }
        }

        let root: &HNode = &tree[levels - 1][0];
        let root = root as *const HNode as *mut HNode;
        let leaf_participants = hierarchy.participants_at(0);
        let leaves = (0..max_threads)
            .map(|tid| {
                let leaf_node: &HNode = &tree[0][tid / leaf_participants];
                CachePadded::new(UnsafeCell::new(Leaf {
                    cur_node: leaf_node as *const HNode as *mut HNode,
                    root_node: root,
                    qnode: Qnode::new(),
                    took_fast_path: false,
                }))
            })
            .collect();

        debug!(
            "hmcs: {} levels, threshold {}, {} leaves",
            levels, threshold, max_threads
        );
        Ok(Self {
            levels,
            _tree: tree,
            leaves,
        })
    }

    #[inline]
    fn my_leaf(&self) -> *mut Leaf {
        self.leaves[topo::thread_id()].get()
    }

    /// Acquire the lock.
    pub fn acquire(&self) {
        unsafe {
            let leaf = &mut *self.my_leaf();
            if ptr_ops::load(&(*leaf.cur_node).lock).is_null()
                && ptr_ops::load(&(*leaf.root_node).lock).is_null()
            {
                leaf.took_fast_path = true;
                acquire_root(leaf.root_node, &leaf.qnode);
                return;
            }
            acquire_helper(self.levels, leaf.cur_node, &leaf.qnode);
        }
    }

    /// Acquire only if the whole hierarchy is free: a single CAS on the
    /// root. Deeper levels never attempt partial acquires.
    pub fn try_acquire(&self) -> bool {
        unsafe {
            let leaf = &mut *self.my_leaf();
            if !ptr_ops::load(&(*leaf.cur_node).lock).is_null()
                || !ptr_ops::load(&(*leaf.root_node).lock).is_null()
            {
                return false;
            }
            leaf.qnode.reuse();
            let me = &leaf.qnode as *const Qnode as *mut Qnode;
            if ptr_ops::cas(&(*leaf.root_node).lock, ptr::null_mut(), me) {
                leaf.took_fast_path = true;
                true
            } else {
                false
            }
        }
    }

    /// Release the lock.
    pub fn release(&self) {
        unsafe {
            let leaf = &mut *self.my_leaf();
            if leaf.took_fast_path {
                release_root(leaf.root_node, &leaf.qnode);
                leaf.took_fast_path = false;
                return;
            }
            release_helper(self.levels, leaf.cur_node, &leaf.qnode);
        }
    }

    /// Whether no thread waits behind the holder at any level.
    pub fn no_waiters(&self) -> bool {
        unsafe {
            let leaf = &*self.my_leaf();
            if leaf.took_fast_path {
                return nowaiters_root(&leaf.qnode);
            }
            nowaiters_helper(self.levels, leaf.cur_node, &leaf.qnode)
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self) -> HmcsGuard<'_> {
        self.acquire();
        HmcsGuard { lock: self }
    }

    /// The number of hierarchy levels.
    pub fn levels(&self) -> usize {
        self.levels
    }
}

/// RAII guard for [`HmcsLock`].
pub struct HmcsGuard<'a> {
    lock: &'a HmcsLock,
}

impl Drop for HmcsGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// MCS release that hands `val` to the successor's status word.
unsafe fn mcs_release_with_value(hnode: *mut HNode, qnode: &Qnode, val: u32) {
    let succ = ptr_ops::load(&qnode.next);
    if !succ.is_null() {
        u32_ops::store(&(*succ).status, val);
        return;
    }
    let me = qnode as *const Qnode as *mut Qnode;
    if ptr_ops::cas(&(*hnode).lock, me, ptr::null_mut()) {
        return;
    }
    let mut succ = ptr_ops::load(&qnode.next);
    while succ.is_null() {
        pr::stall();
        succ = ptr_ops::load(&qnode.next);
    }
    u32_ops::store(&(*succ).status, val);
}

unsafe fn acquire_root(hnode: *mut HNode, qnode: &Qnode) {
    qnode.reuse();
    let me = qnode as *const Qnode as *mut Qnode;
    let pred = ptr_ops::swap(&(*hnode).lock, me);
    if pred.is_null() {
        return;
    }
    ptr_ops::store(&(*pred).next, me);
    while u32_ops::load(&qnode.status) == WAIT {
        pr::stall();
    }
}

unsafe fn release_root(hnode: *mut HNode, qnode: &Qnode) {
    // The root is plain MCS. COHORT_START is handed over unconditionally: it
    // both unlocks the successor and starts its cohort count at 1 without a
    // read of our own status.
    mcs_release_with_value(hnode, qnode, COHORT_START);
}

unsafe fn nowaiters_root(qnode: &Qnode) -> bool {
    ptr_ops::load(&qnode.next).is_null()
}

unsafe fn acquire_helper(level: usize, hnode: *mut HNode, qnode: &Qnode) {
    if level == 1 {
        acquire_root(hnode, qnode);
        return;
    }
    qnode.reuse();
    let me = qnode as *const Qnode as *mut Qnode;
    let pred = ptr_ops::swap(&(*hnode).lock, me);
    if pred.is_null() {
        // First at this level: cohort begins here, climb for the group.
        u32_ops::store(&qnode.status, COHORT_START);
        acquire_helper(level - 1, (*hnode).parent, &(*hnode).node);
        return;
    }
    ptr_ops::store(&(*pred).next, me);
    loop {
        let status = u32_ops::load(&qnode.status);
        if status < ACQUIRE_PARENT {
            // Handed down within the cohort; the lock is ours.
            return;
        }
        if status == ACQUIRE_PARENT {
            u32_ops::store(&qnode.status, COHORT_START);
            acquire_helper(level - 1, (*hnode).parent, &(*hnode).node);
            return;
        }
        pr::stall();
    }
}

unsafe fn release_helper(level: usize, hnode: *mut HNode, qnode: &Qnode) {
    if level == 1 {
        release_root(hnode, qnode);
        return;
    }
    let cur_count = u32_ops::load(&qnode.status);

    if cur_count == (*hnode).threshold {
        // Cohort budget consumed: give the parent back, then tell any local
        // successor to climb.
        release_helper(level - 1, (*hnode).parent, &(*hnode).node);
        mcs_release_with_value(hnode, qnode, ACQUIRE_PARENT);
        return;
    }

    let succ = ptr_ops::load(&qnode.next);
    if !succ.is_null() {
        u32_ops::store(&(*succ).status, cur_count + 1);
        return;
    }
    release_helper(level - 1, (*hnode).parent, &(*hnode).node);
    mcs_release_with_value(hnode, qnode, ACQUIRE_PARENT);
}

unsafe fn nowaiters_helper(level: usize, hnode: *mut HNode, qnode: &Qnode) -> bool {
    if level == 1 {
        return nowaiters_root(qnode);
    }
    if !ptr_ops::load(&qnode.next).is_null() {
        return false;
    }
    nowaiters_helper(level - 1, (*hnode).parent, &(*hnode).node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn hierarchy() -> Hierarchy {
        let max = topo::max_threads();
        let participants = if max % 4 == 0 {
            vec![2, max / 2, max]
        } else if max % 2 == 0 {
            vec![2, max]
        } else {
            vec![max]
        };
        Hierarchy::from_participants(participants, max).unwrap()
    }

    #[test]
    fn test_uncontended_fast_path() {
        let lock = HmcsLock::with_hierarchy(&hierarchy(), 256).unwrap();
        lock.acquire();
        assert!(lock.no_waiters());
        lock.release();
        // Fast path again after a full acquire/release cycle.
        lock.acquire();
        lock.release();
    }

    #[test]
    fn test_try_acquire() {
        let lock = HmcsLock::with_hierarchy(&hierarchy(), 256).unwrap();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_rejects_foreign_bound() {
        let h = Hierarchy::from_participants(vec![2], 2);
        if topo::max_threads() != 2 {
            assert!(HmcsLock::with_hierarchy(&h.unwrap(), 256).is_err());
        }
    }

    fn exclusion_run(threshold: u32, nthreads: usize, niter: u64) {
        let lock = Arc::new(HmcsLock::with_hierarchy(&hierarchy(), threshold).unwrap());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..nthreads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..niter {
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
        assert_eq!(counter.load(Ordering::Relaxed), nthreads as u64 * niter);
    }

    #[test]
    fn test_mutual_exclusion() {
        exclusion_run(256, 4, 20_000);
    }

    // A tiny threshold exercises the cohort hand-up path constantly.
    #[test]
    fn test_mutual_exclusion_tiny_threshold() {
        exclusion_run(2, 4, 10_000);
    }

    #[test]
    fn test_guard() {
        let lock = HmcsLock::with_hierarchy(&hierarchy(), 256).unwrap();
        {
            let _g = lock.lock();
        }
        lock.acquire();
        lock.release();
    }
}
