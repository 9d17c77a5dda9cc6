//! Combining FIFO queue.
//!
//! A plain sentinel-headed linked list made concurrent not by fine-grained
//! atomics but by running every operation through a combining lock: one
//! [`DsmSync`](crate::dsm::DsmSync) instance serializes enqueues, another
//! serializes dequeues, and whichever thread is elected combiner applies a
//! whole batch of queued operations in one pass over shared state it owns
//! exclusively. Synchronization cost is paid once per batch instead of once
//! per operation.

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::sync::atomic::AtomicPtr;
use std::ptr;

use crate::dsm::DsmSync;
use crate::pr::ptr_ops;

struct Node<T> {
    data: MaybeUninit<T>,
    // Written by the enqueue combiner, read by the dequeue combiner.
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(data: MaybeUninit<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            data,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A combining-based MPMC FIFO queue.
pub struct DsmQueue<T> {
    enq: DsmSync,
    deq: DsmSync,
    /// Owned by the dequeue-side combiner.
    head: Cell<*mut Node<T>>,
    /// Owned by the enqueue-side combiner.
    tail: Cell<*mut Node<T>>,
}

unsafe impl<T: Send> Send for DsmQueue<T> {}
unsafe impl<T: Send> Sync for DsmQueue<T> {}

struct EnqReq<T> {
    q: *const DsmQueue<T>,
    data: MaybeUninit<T>,
}

struct DeqReq<T> {
    q: *const DsmQueue<T>,
    out: Option<T>,
}

fn apply_enq<T>(req: *mut u8) {
    unsafe {
        let req = &mut *(req as *mut EnqReq<T>);
        let q = &*req.q;
        let node = Node::boxed(MaybeUninit::new(req.data.assume_init_read()));
        ptr_ops::store(&(*q.tail.get()).next, node);
        q.tail.set(node);
    }
}

fn apply_deq<T>(req: *mut u8) {
    unsafe {
        let req = &mut *(req as *mut DeqReq<T>);
        let q = &*req.q;
        let head = q.head.get();
        let next = ptr_ops::load(&(*head).next);
        if next.is_null() {
            req.out = None;
            return;
        }
        q.head.set(next);
        req.out = Some((*next).data.assume_init_read());
        drop(Box::from_raw(head));
    }
}

impl<T: Send> DsmQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let sentinel = Node::boxed(MaybeUninit::uninit());
        Self {
            enq: DsmSync::new(),
            deq: DsmSync::new(),
            head: Cell::new(sentinel),
            tail: Cell::new(sentinel),
        }
    }

    /// Append `data` through the enqueue-side combiner.
    pub fn enqueue(&self, data: T) {
        let mut req = EnqReq {
            q: self as *const DsmQueue<T>,
            data: MaybeUninit::new(data),
        };
        // The request is applied before sync returns, so stack storage is
        // fine; the payload is moved out by whichever thread applies it.
        self.enq.sync(apply_enq::<T>, &mut req as *mut EnqReq<T> as *mut u8);
    }

    /// Remove the oldest element through the dequeue-side combiner.
    pub fn dequeue(&self) -> Option<T> {
        let mut req = DeqReq {
            q: self as *const DsmQueue<T>,
            out: None,
        };
        self.deq.sync(apply_deq::<T>, &mut req as *mut DeqReq<T> as *mut u8);
        req.out
    }
}

impl<T: Send> Default for DsmQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DsmQueue<T> {
    fn drop(&mut self) {
        let mut cur = self.head.get();
        let mut first = true;
        while !cur.is_null() {
            let next = unsafe { ptr_ops::load_relaxed(&(*cur).next) };
            unsafe {
                if !first {
                    (*cur).data.assume_init_drop();
                }
                drop(Box::from_raw(cur));
            }
            first = false;
            cur = next;
        }
    }
}
