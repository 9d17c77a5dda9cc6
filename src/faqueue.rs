//! Fetch-add segment queue.
//!
//! Producers reserve strictly ordered slots with one fetch-add on a global
//! tail index; the slot number names a cell inside a linked list of
//! fixed-size segments, allocated on demand with a CAS on the segment link.
//! The single consumer walks cells in index order, so the queue is FIFO
//! across all producers in fetch-add order.
//!
//! A cell holds a reserved sentinel until its producer stores the payload;
//! the consumer treats the first still-reserved cell as the end of the
//! queue, which is what makes the out-of-order completion of racing
//! producers invisible.

use core::cell::Cell;
use core::sync::atomic::{AtomicPtr, AtomicU64};
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::pr::{ptr_ops, u64_ops};

/// Cells per segment.
const SEG_SIZE: usize = 1 << 10;

/// Reserved cell sentinel: never a valid payload pointer.
#[inline]
fn alpha<T>() -> *mut T {
    usize::MAX as *mut T
}

struct Segment<T> {
    id: u64,
    next: AtomicPtr<Segment<T>>,
    cells: Box<[AtomicPtr<T>]>,
}

impl<T> Segment<T> {
    fn boxed(id: u64) -> *mut Segment<T> {
        Box::into_raw(Box::new(Segment {
            id,
            next: AtomicPtr::new(ptr::null_mut()),
            cells: (0..SEG_SIZE).map(|_| AtomicPtr::new(alpha())).collect(),
        }))
    }
}

/// A fetch-add segment queue: multi-producer, single-consumer, strict FIFO.
pub struct FaQueue<T> {
    /// Consumer-private global head index.
    head: Cell<u64>,
    tail: CachePadded<AtomicU64>,
    /// Consumer-private pointer to the segment holding `head`.
    seg_head: Cell<*mut Segment<T>>,
    /// Producers' hint: a segment at or below the highest reserved slot.
    seg_tail: CachePadded<AtomicPtr<Segment<T>>>,
}

unsafe impl<T: Send> Send for FaQueue<T> {}
unsafe impl<T: Send> Sync for FaQueue<T> {}

impl<T> FaQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let seg = Segment::boxed(0);
        Self {
            head: Cell::new(0),
            tail: CachePadded::new(AtomicU64::new(0)),
            seg_head: Cell::new(seg),
            seg_tail: CachePadded::new(AtomicPtr::new(seg)),
        }
    }

    /// Follow (or allocate) the link to the segment with id `seg_id`.
    fn advance(seg: *mut Segment<T>, seg_id: u64) -> *mut Segment<T> {
        unsafe {
            let mut next = ptr_ops::load(&(*seg).next);
            if next.is_null() {
                let fresh = Segment::boxed(seg_id);
                if !ptr_ops::cas_weak(&(*seg).next, ptr::null_mut(), fresh) {
                    drop(Box::from_raw(fresh));
                }
                next = ptr_ops::load(&(*seg).next);
            }
            next
        }
    }

    /// Append `data` at the next reserved slot.
    pub fn enqueue(&self, data: T) {
        // Snapshot the segment hint before reserving: a hint observed now
        // can only name a segment at or below our future slot.
        let mut seg = ptr_ops::load(&self.seg_tail);
        let cell_id = u64_ops::faa(&self.tail, 1);
        let target = cell_id / SEG_SIZE as u64;
        unsafe {
            let mut id = (*seg).id;
            while id < target {
                seg = Self::advance(seg, id + 1);
                id += 1;
            }
            let hint = ptr_ops::load(&self.seg_tail);
            if (*hint).id < id {
                let _ = ptr_ops::cas(&self.seg_tail, hint, seg);
            }
            let cell = &(*seg).cells[(cell_id % SEG_SIZE as u64) as usize];
            ptr_ops::store(cell, Box::into_raw(Box::new(data)));
        }
    }

    /// Remove the element at the head slot, if its producer has finished.
    ///
    /// # Safety
    ///
    /// Single consumer: no other thread may call `dequeue` concurrently.
    pub unsafe fn dequeue(&self) -> Option<T> {
        let head = self.head.get();
        let seg = self.seg_head.get();
        let cell = &(*seg).cells[(head % SEG_SIZE as u64) as usize];
        let data = ptr_ops::load(cell);
        if data == alpha() {
            return None;
        }
        let data = *Box::from_raw(data);
        self.head.set(head + 1);
        if (head + 1) % SEG_SIZE as u64 == 0 {
            // Every cell of this segment has been produced and consumed;
            // no producer can still be writing into it.
            debug_assert!((*seg).cells.iter().all(|c| ptr_ops::load(c) != alpha()));
            let next = Self::advance(seg, (head + 1) / SEG_SIZE as u64);
            self.seg_head.set(next);
            drop(Box::from_raw(seg));
        }
        Some(data)
    }
}

impl<T> Default for FaQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FaQueue<T> {
    fn drop(&mut self) {
        let mut head = self.head.get();
        let tail = u64_ops::load_relaxed(&self.tail);
        let mut seg = self.seg_head.get();
        // Drop unconsumed produced payloads, then the segment chain.
        while !seg.is_null() {
            unsafe {
                while head < tail && head / SEG_SIZE as u64 == (*seg).id {
                    let cell = &(*seg).cells[(head % SEG_SIZE as u64) as usize];
                    let data = ptr_ops::load_relaxed(cell);
                    if data != alpha() {
                        drop(Box::from_raw(data));
                    }
                    head += 1;
                }
                let next = ptr_ops::load_relaxed(&(*seg).next);
                drop(Box::from_raw(seg));
                seg = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = FaQueue::new();
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
    fn test_segment_boundary_crossing() {
        let q = FaQueue::new();
        let count = 3 * SEG_SIZE + 7;
        for i in 0..count {
            q.enqueue(i);
        }
        for i in 0..count {
            assert_eq!(unsafe { q.dequeue() }, Some(i));
        }
        assert_eq!(unsafe { q.dequeue() }, None);
    }

    #[test]
    fn test_drop_with_elements() {
        let q = FaQueue::new();
        for i in 0..(SEG_SIZE + 10) {
            q.enqueue(i.to_string());
        }
        unsafe {
            q.dequeue();
        }
    }

    // The fetch-add fixes a total order; the consumer must see exactly the
    // per-producer submission orders interleaved.
    #[test]
    fn test_mpsc_global_fifo() {
        const NPRODUCERS: usize = 4;
        const NITEMS: usize = 10_000;

        let q = Arc::new(FaQueue::new());
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
    }
}
