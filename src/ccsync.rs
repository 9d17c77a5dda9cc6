//! CC-Synch combining lock.
//!
//! Sibling of [`DsmSync`](crate::dsm::DsmSync) tuned for cache-coherent
//! machines. Instead of toggling between two personal nodes, each thread
//! owns a single node that it trades with the queue on every operation: the
//! swap hands the thread its predecessor's node, the announcement is written
//! into that node, and the node received from the queue becomes the spare
//! for the next call. The queue always ends in a dummy node whose owner is
//! the next elected combiner.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicPtr, AtomicU32};
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::pr::{self, ptr_ops, u32_ops};
use crate::topo;

/// Request applier: called once, by whichever thread combines the request.
pub type ApplyFn = fn(*mut u8);

/// Largest batch a single combiner executes.
const MAX_COMBINE: u32 = 1 << 10;

const FALSE: u32 = 0;
const TRUE: u32 = 1;

#[repr(C)]
struct Node {
    req: UnsafeCell<*mut u8>,
    apply: UnsafeCell<Option<ApplyFn>>,
    wait: AtomicU32,
    completed: AtomicU32,
    next: AtomicPtr<Node>,
}

impl Node {
    fn boxed() -> *mut Node {
        Box::into_raw(Box::new(Node {
            req: UnsafeCell::new(ptr::null_mut()),
            apply: UnsafeCell::new(None),
            wait: AtomicU32::new(FALSE),
            completed: AtomicU32::new(FALSE),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A CC-Synch combining lock.
pub struct CcSync {
    tail: CachePadded<AtomicPtr<Node>>,
    spares: Box<[CachePadded<Cell<*mut Node>>]>,
}

unsafe impl Send for CcSync {}
unsafe impl Sync for CcSync {}

impl CcSync {
    /// Create a new combining lock. The queue starts as a single dummy node.
    pub fn new() -> Self {
        let spares = (0..topo::max_threads())
            .map(|_| CachePadded::new(Cell::new(ptr::null_mut())))
            .collect();
        Self {
            tail: CachePadded::new(AtomicPtr::new(Node::boxed())),
            spares,
        }
    }

    /// Submit `(apply, req)` and return once it has been applied.
    pub fn sync(&self, apply: ApplyFn, req: *mut u8) {
        unsafe {
            let spare = &self.spares[topo::thread_id()];
            let mut next_node = spare.get();
            if next_node.is_null() {
                next_node = Node::boxed();
            }

            ptr_ops::store(&(*next_node).next, ptr::null_mut());
            u32_ops::store(&(*next_node).wait, TRUE);
            u32_ops::store(&(*next_node).completed, FALSE);

            // The swap assigns us the old dummy; the announcement goes there
            // and the node we brought becomes the new dummy.
            let cur_node = ptr_ops::swap(&self.tail, next_node);
            *(*cur_node).req.get() = req;
            *(*cur_node).apply.get() = Some(apply);
            ptr_ops::store(&(*cur_node).next, next_node);
            spare.set(cur_node);

            while u32_ops::load(&(*cur_node).wait) == TRUE {
                pr::stall();
            }
            if u32_ops::load(&(*cur_node).completed) == TRUE {
                return;
            }

            // Combiner: apply from our node up to the dummy or the bound.
            let mut tmp = cur_node;
            let mut counter: u32 = 0;
            loop {
                let next = ptr_ops::load(&(*tmp).next);
                if next.is_null() || counter >= MAX_COMBINE {
                    break;
                }
                counter += 1;
                let tmp_apply =
                    (*(*tmp).apply.get()).expect("announced request without applier");
                tmp_apply(*(*tmp).req.get());
                u32_ops::store(&(*tmp).completed, TRUE);
                u32_ops::store(&(*tmp).wait, FALSE);
                tmp = next;
            }
            // Hand the combiner role to the owner of the stopping node.
            u32_ops::store(&(*tmp).wait, FALSE);
        }
    }
}

impl Default for CcSync {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CcSync {
    fn drop(&mut self) {
        // Live nodes are the per-thread spares plus the tail chain; a node
        // can appear in both views, so dedupe before freeing.
        let mut seen: Vec<*mut Node> = Vec::new();
        for spare in self.spares.iter() {
            let p = spare.get();
            if !p.is_null() && !seen.contains(&p) {
                seen.push(p);
            }
        }
        let mut cur = ptr_ops::load_relaxed(&self.tail);
        while !cur.is_null() {
            if !seen.contains(&cur) {
                seen.push(cur);
            }
            cur = unsafe { ptr_ops::load_relaxed(&(*cur).next) };
        }
        for p in seen {
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const NTHREADS: usize = 4;
    const NITER: i64 = 50_000;

    struct Tally {
        global: UnsafeCell<i64>,
    }
    unsafe impl Sync for Tally {}

    #[test]
    fn test_sync_applies_all_requests() {
        static TALLY: Tally = Tally {
            global: UnsafeCell::new(0),
        };
        fn work(req: *mut u8) {
            unsafe { *TALLY.global.get() += req as usize as i64 };
        }

        let cc = Arc::new(CcSync::new());
        let handles: Vec<_> = (0..NTHREADS)
            .map(|_| {
                let cc = Arc::clone(&cc);
                std::thread::spawn(move || {
                    for v in 1..=NITER {
                        cc.sync(work, v as usize as *mut u8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let expected = NTHREADS as i64 * (NITER * (NITER + 1) / 2);
        unsafe { assert_eq!(*TALLY.global.get(), expected) };
    }

    #[test]
    fn test_single_thread() {
        static TALLY: Tally = Tally {
            global: UnsafeCell::new(0),
        };
        fn work(req: *mut u8) {
            unsafe { *TALLY.global.get() += req as usize as i64 };
        }

        let cc = CcSync::new();
        for _ in 0..100 {
            cc.sync(work, 1 as *mut u8);
        }
        unsafe { assert_eq!(*TALLY.global.get(), 100) };
    }

    #[test]
    fn test_drop_reclaims_nodes() {
        let cc = CcSync::new();
        fn noop(_req: *mut u8) {}
        cc.sync(noop, ptr::null_mut());
        drop(cc);
    }
}
