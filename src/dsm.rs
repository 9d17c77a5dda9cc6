//! DSM-Synch combining lock.
//!
//! A thread announces an operation `(apply, req)` by swapping a personal
//! queue node into a shared tail. Either another thread (the *combiner*)
//! executes the request on its behalf and marks it complete, or the
//! announcing thread finds itself elected combiner and walks the request
//! list, applying a bounded batch including its own. Exactly one combiner is
//! active at a time, so applied operations run under mutual exclusion
//! without each thread paying for a lock hand-off.
//!
//! Besides fire-and-forget [`sync`](DsmSync::sync), the lock offers a
//! bracketed form: [`acquire`](DsmSync::acquire) / [`release`](DsmSync::release)
//! let the caller run arbitrary code under the same exclusion, with an
//! internal MCS lock serializing bracketed holders against each other.
//! While bracketed, the holder occupies an *acquire-only* slot (null
//! request) in the combining queue, which is where combiners stop.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicU32};
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::mcs::McsLock;
use crate::pr::{self, ptr_ops, u32_ops};
use crate::topo;

/// Request applier: called once, by whichever thread combines the request.
pub type ApplyFn = fn(*mut u8);

/// Largest batch a single combiner executes beyond its own request.
const MAX_COMBINE: u32 = 1 << 10;

const UNLOCKED: u32 = 0;
const WAIT: u32 = 1;
const COMPLETE: u32 = 2;

#[repr(C)]
struct Qnode {
    req: UnsafeCell<*mut u8>,
    apply: UnsafeCell<Option<ApplyFn>>,
    status: AtomicU32,
    next: AtomicPtr<Qnode>,
}

impl Qnode {
    const fn new() -> Self {
        Self {
            req: UnsafeCell::new(ptr::null_mut()),
            apply: UnsafeCell::new(None),
            status: AtomicU32::new(UNLOCKED),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Per-thread state: two queue nodes toggled per call (the previous call's
/// node may still be referenced by a combiner), and the list head remembered
/// between combine and release.
struct Tnode {
    qnodes: [Qnode; 2],
    toggle: usize,
    head: *mut Qnode,
}

impl Tnode {
    const fn new() -> Self {
        Self {
            qnodes: [Qnode::new(), Qnode::new()],
            toggle: 0,
            head: ptr::null_mut(),
        }
    }
}

/// A DSM-Synch combining lock.
pub struct DsmSync {
    lock: McsLock,
    tail: CachePadded<AtomicPtr<Qnode>>,
    tnodes: Box<[CachePadded<UnsafeCell<Tnode>>]>,
}

unsafe impl Send for DsmSync {}
unsafe impl Sync for DsmSync {}

impl DsmSync {
    /// Create a new combining lock.
    pub fn new() -> Self {
        let tnodes = (0..topo::max_threads())
            .map(|_| CachePadded::new(UnsafeCell::new(Tnode::new())))
            .collect();
        Self {
            lock: McsLock::new(),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tnodes,
        }
    }

    #[inline]
    fn my_tnode(&self) -> *mut Tnode {
        self.tnodes[topo::thread_id()].get()
    }

    /// Submit `(apply, req)` and return once it has been applied, whether
    /// by a combiner or by the caller combining its own batch.
    ///
    /// `req` must be non-null; a null request pointer marks acquire-only
    /// slots internally.
    pub fn sync(&self, apply: ApplyFn, req: *mut u8) {
        unsafe {
            let tnode = self.my_tnode();
            self.acq_enq(tnode, Some(apply), req);
            self.combine(tnode);
            self.release_queue(tnode);
        }
    }

    /// Enter the critical section. Pending announced requests are combined
    /// on the way in; the caller then holds exclusive access until
    /// [`release`](Self::release).
    pub fn acquire(&self) {
        self.lock.acquire();
        unsafe {
            let tnode = self.my_tnode();
            self.acq_enq(tnode, None, ptr::null_mut());
            self.combine(tnode);
        }
    }

    /// [`acquire`](Self::acquire) with an explicit applier, for callers that
    /// announce requests without per-request appliers elsewhere.
    pub fn cacq(&self, apply: ApplyFn) {
        self.lock.acquire();
        unsafe {
            let tnode = self.my_tnode();
            self.acq_enq(tnode, Some(apply), ptr::null_mut());
            self.combine(tnode);
        }
    }

    /// Try to enter the critical section without waiting on the bracketing
    /// lock. On success the caller must pair with [`release`](Self::release).
    pub fn try_cacq(&self, apply: ApplyFn) -> bool {
        if !self.lock.try_acquire() {
            return false;
        }
        unsafe {
            let tnode = self.my_tnode();
            self.acq_enq(tnode, Some(apply), ptr::null_mut());
            self.combine(tnode);
        }
        true
    }

    /// Leave the critical section entered by [`acquire`](Self::acquire),
    /// [`cacq`](Self::cacq) or a successful [`try_cacq`](Self::try_cacq).
    pub fn release(&self) {
        unsafe {
            let tnode = self.my_tnode();
            self.release_queue(tnode);
        }
        self.lock.release();
    }

    /// Announce and wait until served or elected.
    unsafe fn acq_enq(&self, tnode: *mut Tnode, apply: Option<ApplyFn>, req: *mut u8) {
        let tnode = &mut *tnode;
        tnode.toggle = 1 - tnode.toggle;
        let local = &tnode.qnodes[tnode.toggle];
        u32_ops::store(&local.status, WAIT);
        ptr_ops::store(&local.next, ptr::null_mut());
        *local.req.get() = req;
        *local.apply.get() = apply;

        // The swap both enqueues and publishes the announcement.
        let me = local as *const Qnode as *mut Qnode;
        let pred = ptr_ops::swap(&self.tail, me);
        if !pred.is_null() {
            ptr_ops::store(&(*pred).next, me);
            while u32_ops::load(&local.status) == WAIT {
                pr::stall();
            }
        }
    }

    /// If still pending after the spin, the caller is the combiner: apply a
    /// bounded prefix of the list starting at its own node.
    unsafe fn combine(&self, tnode: *mut Tnode) {
        let tnode = &mut *tnode;
        let local = &tnode.qnodes[tnode.toggle];
        if u32_ops::load(&local.status) == COMPLETE {
            tnode.head = ptr::null_mut();
            return;
        }

        let mut head = local as *const Qnode as *mut Qnode;
        let mut counter: u32 = 0;
        loop {
            let req = *(*head).req.get();
            if req.is_null() {
                // An acquire-only slot: only the first node of a bracketed
                // combiner's own batch can look like this.
                debug_assert_eq!(counter, 0);
            } else {
                let apply = (*(*head).apply.get()).expect("announced request without applier");
                apply(req);
                u32_ops::store(&(*head).status, COMPLETE);
            }
            let next = ptr_ops::load(&(*head).next);
            if next.is_null()
                || ptr_ops::load(&(*next).next).is_null()
                || (*(*next).req.get()).is_null()
                || counter > MAX_COMBINE
            {
                break;
            }
            head = next;
            counter += 1;
        }
        tnode.head = head;
    }

    /// Detach from the queue at the remembered stopping point, electing the
    /// next combiner if one is queued.
    unsafe fn release_queue(&self, tnode: *mut Tnode) {
        let tnode = &mut *tnode;
        let head = tnode.head;
        if head.is_null() {
            // Our request was completed by someone else; nothing to release.
            return;
        }

        if ptr_ops::load(&(*head).next).is_null() {
            if ptr_ops::cas(&self.tail, head, ptr::null_mut()) {
                return;
            }
            // An enqueuer swapped in; wait for it to link.
            while ptr_ops::load(&(*head).next).is_null() {
                pr::stall();
            }
        }
        let next = ptr_ops::load(&(*head).next);
        u32_ops::store(&(*next).status, UNLOCKED);
        ptr_ops::store(&(*head).next, ptr::null_mut());
    }
}

impl Default for DsmSync {
    fn default() -> Self {
        Self::new()
    }
}
