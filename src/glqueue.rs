//! Global-lock queue.
//!
//! A sentinel-headed singly linked list behind one mutex. The baseline
//! against which the lock-free queues are measured; correctness follows
//! trivially from mutual exclusion.

use core::mem::MaybeUninit;
use std::ptr;
use std::sync::Mutex;

struct Node<T> {
    data: MaybeUninit<T>,
    next: *mut Node<T>,
}

struct Inner<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
}

/// A mutex-protected FIFO queue.
pub struct GlQueue<T> {
    inner: Mutex<Inner<T>>,
}

unsafe impl<T: Send> Send for GlQueue<T> {}
unsafe impl<T: Send> Sync for GlQueue<T> {}

impl<T> GlQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node {
            data: MaybeUninit::uninit(),
            next: ptr::null_mut(),
        }));
        Self {
            inner: Mutex::new(Inner {
                head: sentinel,
                tail: sentinel,
            }),
        }
    }

    /// Append `data`.
    pub fn enqueue(&self, data: T) {
        let node = Box::into_raw(Box::new(Node {
            data: MaybeUninit::new(data),
            next: ptr::null_mut(),
        }));
        let mut inner = self.inner.lock().unwrap();
        unsafe { (*inner.tail).next = node };
        inner.tail = node;
    }

    /// Remove the oldest element, if any.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.head;
        let next = unsafe { (*head).next };
        if next.is_null() {
            return None;
        }
        // The successor becomes the new sentinel; its payload moves out.
        inner.head = next;
        let data = unsafe { (*next).data.assume_init_read() };
        drop(unsafe { Box::from_raw(head) });
        Some(data)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        unsafe { (*inner.head).next.is_null() }
    }
}

impl<T> Default for GlQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for GlQueue<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        // The first node is the sentinel: free it without touching data.
        let mut cur = inner.head;
        let mut first = true;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
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
