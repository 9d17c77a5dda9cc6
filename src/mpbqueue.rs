//! Bucketed multi-producer queue.
//!
//! An array of swap-based MPSC sub-queues plus a byte-per-bucket state
//! vector. The state bytes live inside an array of machine words, so the
//! single consumer can rule out 8 empty buckets with one word load and only
//! walks byte states inside a word that reports occupancy. The scan starts
//! from a rotating cursor so busy low-numbered buckets cannot starve the
//! rest.
//!
//! Producers set a bucket nonempty only after confirming the enqueue left
//! the sub-queue observably nonempty; the consumer clears the state only
//! after the weak and the strong emptiness checks agree, so a concurrent
//! enqueue's tail reservation is never mistaken for emptiness.

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::swpqueue::SwpQueue;

const EMPTY_BUCKET: u8 = 0;
const NONEMPTY_BUCKET: u8 = 1;

/// Bytes per summary word.
const WORD_BYTES: usize = core::mem::size_of::<u64>();

/// A bucketed multi-producer, single-consumer queue.
pub struct MpbQueue<T> {
    buckets: Box<[SwpQueue<T>]>,
    /// Per-bucket state bytes packed into words; read per word for the
    /// summary scan and per byte for individual buckets.
    state_words: Box<[AtomicU64]>,
    /// Consumer-private rotating scan cursor, in word-set units.
    last_bucket_set: Cell<usize>,
}

unsafe impl<T: Send> Send for MpbQueue<T> {}
unsafe impl<T: Send> Sync for MpbQueue<T> {}

impl<T> MpbQueue<T> {
    /// Create a queue with `nbuckets` sub-queues. The count must be a
    /// positive multiple of the word width in bytes (8).
    pub fn new(nbuckets: usize) -> Result<Self> {
        if nbuckets == 0 || nbuckets % WORD_BYTES != 0 {
            return Err(Error::InvalidBucketCount(nbuckets, WORD_BYTES));
        }
        let buckets = (0..nbuckets).map(|_| SwpQueue::new()).collect();
        let state_words = (0..nbuckets / WORD_BYTES).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            buckets,
            state_words,
            last_bucket_set: Cell::new(0),
        })
    }

    /// Number of buckets.
    #[inline]
    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    /// Byte view of bucket `idx`'s state. Same storage as the word the
    /// summary scan loads.
    #[inline]
    fn state(&self, idx: usize) -> &AtomicU8 {
        debug_assert!(idx < self.buckets.len());
        unsafe { &*(self.state_words.as_ptr() as *const AtomicU8).add(idx) }
    }

    /// Append `data` to `bucket`.
    pub fn enqueue(&self, data: T, bucket: usize) {
        self.buckets[bucket].enqueue(data);
        // The consumer may already have drained the item just pushed; only
        // flag the bucket if it is still observably nonempty.
        if !self.buckets[bucket].is_empty_weak() {
            self.state(bucket).store(NONEMPTY_BUCKET, Ordering::Release);
        }
    }

    /// Dequeue from the first nonempty bucket at or after the rotating
    /// cursor.
    ///
    /// # Safety
    ///
    /// Single consumer: no other thread may call the dequeue operations
    /// concurrently.
    pub unsafe fn dequeue(&self) -> Option<T> {
        let nsets = self.state_words.len();
        let mut data = None;
        let mut i = 0;
        while i < nsets {
            let offset = (self.last_bucket_set.get() + i) % nsets;
            if self.state_words[offset].load(Ordering::Acquire) != 0 {
                let mut found = false;
                for j in 0..WORD_BYTES {
                    let bucket = offset * WORD_BYTES + j;
                    if self.state(bucket).load(Ordering::Acquire) == NONEMPTY_BUCKET {
                        data = self.buckets[bucket].dequeue();
                        if self.buckets[bucket].is_empty_weak()
                            && self.buckets[bucket].is_empty_strong()
                        {
                            self.state(bucket).store(EMPTY_BUCKET, Ordering::Release);
                        }
                        found = true;
                        break;
                    }
                }
                if found {
                    break;
                }
            }
            i += 1;
        }
        // A find leaves the cursor on the word set that produced it; a full
        // scan without one walks i to nsets and leaves the cursor in place.
        self.last_bucket_set
            .set((self.last_bucket_set.get() + i) % nsets);
        data
    }

    /// Dequeue up to `max` items, one per nonempty bucket of the first
    /// occupied word set. Returns the number delivered.
    ///
    /// # Safety
    ///
    /// Single consumer, as [`dequeue`](Self::dequeue).
    pub unsafe fn dequeue_bulk(&self, out: &mut Vec<T>, max: usize) -> usize {
        let nsets = self.state_words.len();
        let mut delivered = 0;
        let mut i = 0;
        while i < nsets {
            let offset = (self.last_bucket_set.get() + i) % nsets;
            if self.state_words[offset].load(Ordering::Acquire) != 0 {
                let mut found = false;
                for j in 0..WORD_BYTES {
                    if delivered >= max {
                        break;
                    }
                    let bucket = offset * WORD_BYTES + j;
                    if self.state(bucket).load(Ordering::Acquire) == NONEMPTY_BUCKET {
                        if let Some(item) = self.buckets[bucket].dequeue() {
                            out.push(item);
                            delivered += 1;
                        }
                        if self.buckets[bucket].is_empty_strong() {
                            let _ = self.state(bucket).compare_exchange(
                                NONEMPTY_BUCKET,
                                EMPTY_BUCKET,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                        found = true;
                    }
                }
                if found {
                    break;
                }
            }
            i += 1;
        }
        // Same cursor rule as the single-item scan: unchanged when nothing
        // was found anywhere.
        self.last_bucket_set
            .set((self.last_bucket_set.get() + i) % nsets);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_bucket_count_validation() {
        assert!(MpbQueue::<u64>::new(0).is_err());
        assert!(MpbQueue::<u64>::new(7).is_err());
        assert!(MpbQueue::<u64>::new(8).is_ok());
        assert!(MpbQueue::<u64>::new(64).is_ok());
    }

    #[test]
    fn test_single_bucket_roundtrip() {
        let q = MpbQueue::new(8).unwrap();
        q.enqueue(1u64, 3);
        q.enqueue(2u64, 3);
        unsafe {
            assert_eq!(q.dequeue(), Some(1));
            assert_eq!(q.dequeue(), Some(2));
            assert_eq!(q.dequeue(), None);
        }
    }

    #[test]
    fn test_scan_finds_any_bucket() {
        let q = MpbQueue::new(16).unwrap();
        q.enqueue(10u64, 13);
        assert_eq!(unsafe { q.dequeue() }, Some(10));
        q.enqueue(11u64, 2);
        assert_eq!(unsafe { q.dequeue() }, Some(11));
    }

    #[test]
    fn test_bulk_dequeue() {
        let q = MpbQueue::new(8).unwrap();
        for b in 0..8 {
            q.enqueue(b as u64, b);
        }
        let mut out = Vec::new();
        let n = unsafe { q.dequeue_bulk(&mut out, 8) };
        assert_eq!(n, out.len());
        assert!(n >= 1);
    }

    // Many producers spread over the buckets; one consumer drains until the
    // full count has been observed.
    #[test]
    fn test_bucketed_dequeue_count() {
        const NPRODUCERS: usize = 15;
        const NBUCKETS: usize = 16;
        const NITEMS: usize = 1_000;

        let q = Arc::new(MpbQueue::new(NBUCKETS).unwrap());
        let producers: Vec<_> = (0..NPRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..NITEMS {
                        q.enqueue((p * NITEMS + i) as u64, p % NBUCKETS);
                    }
                })
            })
            .collect();

        let mut received = 0usize;
        while received < NPRODUCERS * NITEMS {
            if unsafe { q.dequeue() }.is_some() {
                received += 1;
            }
        }
        for h in producers {
            h.join().unwrap();
        }
        assert_eq!(received, NPRODUCERS * NITEMS);
    }
}
