//! Swap-based multi-producer, single-consumer queue.
//!
//! Enqueue reserves its place with one atomic swap on the tail and then
//! links itself into the predecessor's next pointer; no CAS loops, no
//! helping. Dequeue is consumer-private. The price of the two-step enqueue
//! is a window where the tail has moved but the link is not yet published,
//! which is why emptiness comes in two strengths:
//!
//! - [`is_empty_weak`](SwpQueue::is_empty_weak) only looks at the head's
//!   link and may report empty while an enqueuer holds the tail reservation
//!   unlinked
//! - [`is_empty_strong`](SwpQueue::is_empty_strong) also requires the tail
//!   to equal the head, so a false answer means some enqueuer has finished
//!   linking, not merely reserved

use core::mem::MaybeUninit;
use core::sync::atomic::AtomicPtr;
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::pr::ptr_ops;

#[repr(C)]
struct Node<T> {
    data: MaybeUninit<T>,
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

/// A swap-based MPSC queue with a sentinel head.
pub struct SwpQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for SwpQueue<T> {}
unsafe impl<T: Send> Sync for SwpQueue<T> {}

impl<T> SwpQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let sentinel = Node::boxed(MaybeUninit::uninit());
        Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
        }
    }

    /// Append `data`. Any number of producers may call this concurrently.
    pub fn enqueue(&self, data: T) {
        let node = Node::boxed(MaybeUninit::new(data));
        let pred = ptr_ops::swap(&self.tail, node);
        unsafe { ptr_ops::store(&(*pred).next, node) };
    }

    /// Remove the oldest element, if any.
    ///
    /// # Safety
    ///
    /// Single consumer: no other thread may call `dequeue` concurrently.
    pub unsafe fn dequeue(&self) -> Option<T> {
        let head = ptr_ops::load(&self.head);
        let next = ptr_ops::load(&(*head).next);
        if next.is_null() {
            return None;
        }
        ptr_ops::store(&self.head, next);
        let data = (*next).data.assume_init_read();
        drop(Box::from_raw(head));
        Some(data)
    }

    /// Whether the head has no linked successor. May report empty while an
    /// enqueuer has swapped the tail but not yet linked.
    #[inline]
    pub fn is_empty_weak(&self) -> bool {
        let head = ptr_ops::load(&self.head);
        unsafe { ptr_ops::load(&(*head).next).is_null() }
    }

    /// Whether the head has no successor and the tail has not moved. A
    /// false answer is backed by a completed link.
    #[inline]
    pub fn is_empty_strong(&self) -> bool {
        let head = ptr_ops::load(&self.head);
        let tail = ptr_ops::load(&self.tail);
        unsafe { ptr_ops::load(&(*head).next).is_null() && head == tail }
    }
}

impl<T> Default for SwpQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SwpQueue<T> {
    fn drop(&mut self) {
        let mut cur = ptr_ops::load_relaxed(&self.head);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = SwpQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        unsafe {
            assert_eq!(q.dequeue(), Some(1));
            assert_eq!(q.dequeue(), Some(2));
            assert_eq!(q.dequeue(), Some(3));
            assert_eq!(q.dequeue(), None);
        }
    }

    #[test]
    fn test_emptiness() {
        let q = SwpQueue::new();
        assert!(q.is_empty_weak());
        assert!(q.is_empty_strong());
        q.enqueue(7);
        assert!(!q.is_empty_weak());
        assert!(!q.is_empty_strong());
        unsafe {
            assert_eq!(q.dequeue(), Some(7));
        }
        assert!(q.is_empty_weak());
        assert!(q.is_empty_strong());
    }

    #[test]
    fn test_drop_with_elements() {
        let q = SwpQueue::new();
        q.enqueue(String::from("a"));
        q.enqueue(String::from("b"));
    }

    // Producers race on the tail; the single consumer observes each
    // producer's items in submission order and loses none.
    #[test]
    fn test_mpsc_per_producer_order() {
        const NPRODUCERS: usize = 4;
        const NITEMS: usize = 25_000;

        let q = Arc::new(SwpQueue::new());
        let producers: Vec<_> = (0..NPRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..NITEMS {
                        q.enqueue((p, i));
                    }
                })
            })
            .collect();

        let mut counts = [0usize; NPRODUCERS];
        let mut received = 0;
        while received < NPRODUCERS * NITEMS {
            if let Some((p, i)) = unsafe { q.dequeue() } {
                assert_eq!(i, counts[p]);
                counts[p] += 1;
                received += 1;
            }
        }
        for h in producers {
            h.join().unwrap();
        }
        assert!(counts.iter().all(|&c| c == NITEMS));
    }
}
