//! Michael–Scott lock-free queue.
//!
//! Multi-producer, multi-consumer FIFO with the classic two-CAS enqueue and
//! helped tail: an enqueuer that finds the tail lagging swings it forward
//! instead of waiting. Dequeuers move the sentinel head forward and read the
//! payload out of the new sentinel.
//!
//! Dequeued sentinels are retired through the hazard-pointer registry
//! (slot 0 guards the head or tail being examined, slot 1 the successor),
//! so a node is only freed once no thread can still be reading it.

use core::mem::MaybeUninit;
use core::sync::atomic::AtomicPtr;
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::hazard;
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

/// A Michael–Scott MPMC queue.
pub struct MsQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T> MsQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let sentinel = Node::boxed(MaybeUninit::uninit());
        Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
        }
    }

    /// Append `data`.
    pub fn enqueue(&self, data: T) {
        let record = hazard::my_record();
        let node = Node::boxed(MaybeUninit::new(data));
        let mut tail;
        loop {
            tail = ptr_ops::load(&self.tail);
            record.set(0, tail);
            if tail != ptr_ops::load(&self.tail) {
                continue;
            }
            let next = unsafe { ptr_ops::load(&(*tail).next) };
            if next.is_null() {
                if unsafe { ptr_ops::cas_weak(&(*tail).next, ptr::null_mut(), node) } {
                    break;
                }
            } else {
                // Tail is lagging; help it forward.
                ptr_ops::cas_weak(&self.tail, tail, next);
            }
        }
        ptr_ops::cas_weak(&self.tail, tail, node);
        record.clear(0);
    }

    /// Remove the oldest element, if any.
    pub fn dequeue(&self) -> Option<T> {
        let record = hazard::my_record();
        let data;
        let mut head;
        loop {
            head = ptr_ops::load(&self.head);
            record.set(0, head);
            if head != ptr_ops::load(&self.head) {
                continue;
            }
            let tail = ptr_ops::load(&self.tail);
            let next = unsafe { ptr_ops::load(&(*head).next) };
            record.set(1, next);
            if head == tail {
                if next.is_null() {
                    record.clear(0);
                    record.clear(1);
                    return None;
                }
                ptr_ops::cas_weak(&self.tail, tail, next);
            } else if ptr_ops::cas_weak(&self.head, head, next) {
                // The successor is the new sentinel; its payload moves out.
                data = unsafe { (*next).data.assume_init_read() };
                break;
            }
        }
        unsafe { record.retire_box(head) };
        record.clear(0);
        record.clear(1);
        Some(data)
    }
}

impl<T> Default for MsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MsQueue<T> {
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = MsQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_drop_with_elements() {
        let q = MsQueue::new();
        q.enqueue(String::from("a"));
        q.enqueue(String::from("b"));
    }

    // Two producers funnel into two consumers; consumers stop once the
    // expected number of items has been observed.
    #[test]
    fn test_two_sided_funnel() {
        const NPRODUCERS: usize = 2;
        const NCONSUMERS: usize = 2;
        const NITEMS: usize = 1_000;

        let q = Arc::new(MsQueue::new());
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..NPRODUCERS)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for _ in 0..NITEMS {
                        q.enqueue(1u64);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..NCONSUMERS)
            .map(|_| {
                let q = Arc::clone(&q);
                let consumed = Arc::clone(&consumed);
                std::thread::spawn(move || {
                    let mut ones = 0u64;
                    while consumed.load(Ordering::Relaxed) < NPRODUCERS * NITEMS {
                        if let Some(v) = q.dequeue() {
                            ones += v;
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    ones
                })
            })
            .collect();

        for h in producers {
            h.join().unwrap();
        }
        let total: u64 = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, (NPRODUCERS * NITEMS) as u64);
    }

    #[test]
    fn test_per_producer_order() {
        const NITEMS: usize = 20_000;

        let q = Arc::new(MsQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..NITEMS {
                    q.enqueue(i);
                }
            })
        };
        let mut last = None;
        let mut received = 0;
        while received < NITEMS {
            if let Some(v) = q.dequeue() {
                if let Some(prev) = last {
                    assert!(v > prev);
                }
                last = Some(v);
                received += 1;
            }
        }
        producer.join().unwrap();
    }
}
