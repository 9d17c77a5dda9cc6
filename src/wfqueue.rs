//! Wait-free MPMC queue.
//!
//! The fetch-add queue of Yang and Mellor-Crummey: every operation claims a
//! strictly increasing cell index, cells live in a linked list of fixed-size
//! nodes, and the fast path is a single CAS into the claimed cell. A thread
//! whose fast path keeps losing publishes an announce descriptor on its
//! per-thread handle and is helped to completion by its peers, which is
//! what bounds every operation's step count and makes the queue wait-free.
//!
//! Cell values move `BOT -> user value` (fast enqueue) or `BOT -> TOP`
//! (helper declaring the cell abandoned); a cell's enqueue and dequeue
//! descriptor slots move `BOT -> announce -> ...` as helpers apply delayed
//! operations on their owners' behalf.
//!
//! Nodes are reclaimed cooperatively: each handle advertises the id of the
//! node it may be traversing; a cleanup pass computes the minimum safe id
//! across all handles and frees everything older once `2 * nprocs` nodes of
//! garbage have accumulated.
//!
//! The global enqueue/dequeue indices use sequentially consistent fetch-add
//! on the fast path; the wait-freedom argument depends on it.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::topo;

/// Cells per node.
const NODE_SIZE: usize = (1 << 10) - 2;

/// Fast-path spin bound while waiting for a cell's value to appear.
const MAX_SPIN: usize = 100;

/// Fast-path retries before switching to the announced slow path.
const MAX_PATIENCE: i32 = 10;

const BOT: *mut u8 = ptr::null_mut();

#[inline]
fn top<P>() -> *mut P {
    usize::MAX as *mut P
}

/// No node advertised.
const HZD_NONE: u64 = u64::MAX;

#[repr(C)]
struct EnqReq {
    id: AtomicI64,
    val: AtomicPtr<u8>,
}

#[repr(C)]
struct DeqReq {
    id: AtomicI64,
    idx: AtomicI64,
}

#[repr(C)]
struct WfCell {
    val: AtomicPtr<u8>,
    enq: AtomicPtr<EnqReq>,
    deq: AtomicPtr<DeqReq>,
    _pad: [usize; 5],
}

#[repr(C)]
struct Node {
    next: AtomicPtr<Node>,
    id: i64,
    cells: [WfCell; NODE_SIZE],
}

impl Node {
    /// All-zero state is the valid initial state of every field.
    fn alloc(id: i64) -> *mut Node {
        let layout = Layout::new::<Node>();
        let node = unsafe { alloc_zeroed(layout) } as *mut Node;
        assert!(!node.is_null(), "wfqueue node allocation failed");
        unsafe { (*node).id = id };
        node
    }

    unsafe fn free(node: *mut Node) {
        dealloc(node as *mut u8, Layout::new::<Node>());
    }
}

/// Per-thread queue handle.
#[repr(C)]
struct Handle {
    next: Cell<*mut Handle>,
    /// Id of the node this thread may be traversing; [`HZD_NONE`] outside
    /// operations.
    hzd_node_id: AtomicU64,
    /// Node this thread enqueues into.
    ep: AtomicPtr<Node>,
    enq_node_id: Cell<u64>,
    /// Node this thread dequeues from.
    dp: AtomicPtr<Node>,
    deq_node_id: Cell<u64>,
    /// Announced enqueue request.
    er: EnqReq,
    /// Announced dequeue request.
    dr: DeqReq,
    /// Next enqueuer to help, with the id being helped.
    eh: Cell<*mut Handle>,
    help_id: Cell<i64>,
    /// Next dequeuer to help.
    dh: Cell<*mut Handle>,
    /// Spare node to splice in without allocating on the critical path.
    spare: Cell<*mut Node>,
}

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

/// A wait-free MPMC queue.
pub struct WfQueue<T> {
    ei: CachePadded<AtomicI64>,
    di: CachePadded<AtomicI64>,
    /// Reclamation frontier; -1 while a cleanup is in flight.
    hi: CachePadded<AtomicI64>,
    /// Oldest live node.
    hp: AtomicPtr<Node>,
    nprocs: usize,
    handles: Box<[CachePadded<Handle>]>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for WfQueue<T> {}
unsafe impl<T: Send> Sync for WfQueue<T> {}

impl<T: Send> WfQueue<T> {
    /// Create an empty queue with one handle per bindable thread.
    pub fn new() -> Self {
        let nprocs = topo::max_threads();
        let first = Node::alloc(0);
        let handles: Box<[CachePadded<Handle>]> = (0..nprocs)
            .map(|_| {
                CachePadded::new(Handle {
                    next: Cell::new(ptr::null_mut()),
                    hzd_node_id: AtomicU64::new(HZD_NONE),
                    ep: AtomicPtr::new(first),
                    enq_node_id: Cell::new(0),
                    dp: AtomicPtr::new(first),
                    deq_node_id: Cell::new(0),
                    er: EnqReq {
                        id: AtomicI64::new(0),
                        val: AtomicPtr::new(BOT),
                    },
                    dr: DeqReq {
                        id: AtomicI64::new(0),
                        idx: AtomicI64::new(-1),
                    },
                    eh: Cell::new(ptr::null_mut()),
                    help_id: Cell::new(0),
                    dh: Cell::new(ptr::null_mut()),
                    spare: Cell::new(ptr::null_mut()),
                })
            })
            .collect();
        // Close the helping ring.
        for i in 0..nprocs {
            let next: &Handle = &handles[(i + 1) % nprocs];
            let next = next as *const Handle as *mut Handle;
            handles[i].next.set(next);
            handles[i].eh.set(next);
            handles[i].dh.set(next);
        }
        Self {
            ei: CachePadded::new(AtomicI64::new(1)),
            di: CachePadded::new(AtomicI64::new(1)),
            hi: CachePadded::new(AtomicI64::new(0)),
            hp: AtomicPtr::new(first),
            nprocs,
            handles,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn my_handle(&self) -> &Handle {
        &self.handles[topo::thread_id() % self.nprocs]
    }

    /// Append `data`. Wait-free.
    pub fn enqueue(&self, data: T) {
        let th = self.my_handle();
        let v = Box::into_raw(Box::new(data)) as *mut u8;

        th.hzd_node_id
            .store(th.enq_node_id.get(), Ordering::SeqCst);

        let mut id = 0;
        let mut patience = MAX_PATIENCE;
        while !self.enq_fast(th, v, &mut id) {
            patience -= 1;
            if patience < 0 {
                self.enq_slow(th, v, id);
                break;
            }
        }

        th.enq_node_id
            .set(unsafe { (*th.ep.load(Ordering::Relaxed)).id } as u64);
        th.hzd_node_id.store(HZD_NONE, Ordering::Release);
    }

    /// Remove the oldest element, if any. Wait-free.
    pub fn dequeue(&self) -> Option<T> {
        let th = self.my_handle();

        th.hzd_node_id
            .store(th.deq_node_id.get(), Ordering::SeqCst);

        let mut v;
        let mut id = 0;
        let mut patience = MAX_PATIENCE;
        loop {
            v = self.deq_fast(th, &mut id);
            if v != top() {
                break;
            }
            patience -= 1;
            if patience < 0 {
                v = self.deq_slow(th, id);
                break;
            }
        }

        if v != BOT {
            // Pay a helping visit to the next dequeuer in the ring.
            let dh = th.dh.get();
            self.help_deq(th, unsafe { &*dh });
            th.dh.set(unsafe { (*dh).next.get() });
        }

        th.deq_node_id
            .set(unsafe { (*th.dp.load(Ordering::Relaxed)).id } as u64);
        th.hzd_node_id.store(HZD_NONE, Ordering::Release);

        if th.spare.get().is_null() {
            self.cleanup(th);
            th.spare.set(Node::alloc(0));
        }

        if v == BOT {
            None
        } else {
            Some(unsafe { *Box::from_raw(v as *mut T) })
        }
    }

    /// Wait briefly for a cell's value to be published.
    fn spin(p: &AtomicPtr<u8>) -> *mut u8 {
        let mut v = p.load(Ordering::Relaxed);
        let mut patience = MAX_SPIN;
        while v.is_null() && patience > 0 {
            v = p.load(Ordering::Relaxed);
            patience -= 1;
            crate::pr::stall();
        }
        v
    }

    /// Locate (allocating along the way) the cell of index `i`, advancing
    /// `start` to that cell's node.
    fn find_cell(&self, start: &AtomicPtr<Node>, i: i64, th: &Handle) -> *mut WfCell {
        let mut curr = start.load(Ordering::Relaxed);
        let target = i / NODE_SIZE as i64;
        unsafe {
            let mut j = (*curr).id;
            while j < target {
                let mut next = (*curr).next.load(Ordering::Relaxed);
                if next.is_null() {
                    let mut temp = th.spare.get();
                    if temp.is_null() {
                        temp = Node::alloc(0);
                        th.spare.set(temp);
                    }
                    (*temp).id = j + 1;
                    match (*curr).next.compare_exchange(
                        ptr::null_mut(),
                        temp,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            next = temp;
                            th.spare.set(ptr::null_mut());
                        }
                        Err(found) => next = found,
                    }
                }
                curr = next;
                j += 1;
            }
            start.store(curr, Ordering::Relaxed);
            &mut (*curr).cells[(i % NODE_SIZE as i64) as usize]
        }
    }

    fn enq_fast(&self, th: &Handle, v: *mut u8, id: &mut i64) -> bool {
        let i = self.ei.fetch_add(1, Ordering::SeqCst);
        let c = self.find_cell(&th.ep, i, th);
        let cell = unsafe { &*c };
        if cell
            .val
            .compare_exchange(BOT, v, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            true
        } else {
            *id = i;
            false
        }
    }

    fn enq_slow(&self, th: &Handle, v: *mut u8, id: i64) {
        let enq = &th.er;
        enq.val.store(v, Ordering::Relaxed);
        enq.id.store(id, Ordering::Release);
        let enq_ptr = enq as *const EnqReq as *mut EnqReq;

        let tail = AtomicPtr::new(th.ep.load(Ordering::Relaxed));
        let mut i;
        loop {
            i = self.ei.fetch_add(1, Ordering::Relaxed);
            let c = self.find_cell(&tail, i, th);
            let cell = unsafe { &*c };
            if cell
                .enq
                .compare_exchange(ptr::null_mut(), enq_ptr, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
                && cell.val.load(Ordering::Relaxed) != top()
            {
                let _ = enq
                    .id
                    .compare_exchange(id, -i, Ordering::Relaxed, Ordering::Relaxed);
                break;
            }
            if enq.id.load(Ordering::Relaxed) <= 0 {
                break;
            }
        }

        // The request's id now records the claimed cell (negated).
        let id = -enq.id.load(Ordering::Relaxed);
        let c = self.find_cell(&th.ep, id, th);
        if id > i {
            let mut ei = self.ei.load(Ordering::Relaxed);
            while ei <= id {
                match self.ei.compare_exchange(
                    ei,
                    id + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(cur) => ei = cur,
                }
            }
        }
        unsafe { (*c).val.store(v, Ordering::Relaxed) };
    }

    /// Resolve the value of cell `i` on behalf of whichever enqueuer owns
    /// it. Returns the value, `TOP` (cell abandoned, queue maybe nonempty
    /// beyond it), or `BOT` (queue observed empty up to `i`).
    fn help_enq(&self, th: &Handle, c: *mut WfCell, i: i64) -> *mut u8 {
        let cell = unsafe { &*c };

        let mut v = Self::spin(&cell.val);
        if (v != top() && v != BOT)
            || (v == BOT && {
                match cell.val.compare_exchange(
                    BOT,
                    top(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        v = top();
                        false
                    }
                    Err(cur) => {
                        v = cur;
                        v != top()
                    }
                }
            })
        {
            return v;
        }

        // The cell's value is TOP: look for a delayed enqueuer to install.
        let mut e = cell.enq.load(Ordering::Relaxed);
        if e.is_null() {
            let mut ph = th.eh.get();
            let mut pe = unsafe { &(*ph).er };
            let mut id = pe.id.load(Ordering::Relaxed);

            if th.help_id.get() != 0 && th.help_id.get() != id {
                th.help_id.set(0);
                th.eh.set(unsafe { (*ph).next.get() });
                ph = th.eh.get();
                pe = unsafe { &(*ph).er };
                id = pe.id.load(Ordering::Relaxed);
            }

            let pe_ptr = pe as *const EnqReq as *mut EnqReq;
            if id > 0
                && id <= i
                && cell
                    .enq
                    .compare_exchange(ptr::null_mut(), pe_ptr, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                th.help_id.set(id);
            } else {
                th.eh.set(unsafe { (*ph).next.get() });
            }

            e = cell.enq.load(Ordering::Relaxed);
            if e.is_null()
                && cell
                    .enq
                    .compare_exchange(
                        ptr::null_mut(),
                        top(),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                e = top();
            } else if e.is_null() {
                e = cell.enq.load(Ordering::Relaxed);
            }
        }

        if e == top() {
            return if self.ei.load(Ordering::Relaxed) <= i {
                BOT
            } else {
                top()
            };
        }

        let req = unsafe { &*e };
        let ei = req.id.load(Ordering::Acquire);
        let ev = req.val.load(Ordering::Acquire);

        if ei > i {
            if cell.val.load(Ordering::Relaxed) == top()
                && self.ei.load(Ordering::Relaxed) <= i
            {
                return BOT;
            }
        } else if (ei > 0
            && req
                .id
                .compare_exchange(ei, -i, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok())
            || (ei == -i && cell.val.load(Ordering::Relaxed) == top())
        {
            let mut gi = self.ei.load(Ordering::Relaxed);
            while gi <= i {
                match self
                    .ei
                    .compare_exchange(gi, i + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(cur) => gi = cur,
                }
            }
            cell.val.store(ev, Ordering::Relaxed);
        }

        cell.val.load(Ordering::Relaxed)
    }

    /// Drive `ph`'s announced dequeue to completion.
    fn help_deq(&self, th: &Handle, ph: &Handle) {
        let deq = &ph.dr;
        let mut idx = deq.idx.load(Ordering::Acquire);
        let id = deq.id.load(Ordering::Relaxed);

        if idx < id {
            return;
        }

        let dp_start = ph.dp.load(Ordering::Relaxed);
        th.hzd_node_id
            .store(ph.hzd_node_id.load(Ordering::Relaxed), Ordering::Relaxed);
        crate::pr::fence_seqcst();
        idx = deq.idx.load(Ordering::Relaxed);

        let deq_ptr = deq as *const DeqReq as *mut DeqReq;
        let dp = AtomicPtr::new(dp_start);
        let mut i = id + 1;
        let mut old = id;
        let mut new = 0;
        loop {
            let h = AtomicPtr::new(dp.load(Ordering::Relaxed));
            while idx == old && new == 0 {
                let c = self.find_cell(&h, i, th);

                let mut di = self.di.load(Ordering::Relaxed);
                while di <= i {
                    match self
                        .di
                        .compare_exchange(di, i + 1, Ordering::Relaxed, Ordering::Relaxed)
                    {
                        Ok(_) => break,
                        Err(cur) => di = cur,
                    }
                }

                let v = self.help_enq(th, c, i);
                let cell = unsafe { &*c };
                if v == BOT || (v != top() && cell.deq.load(Ordering::Relaxed).is_null()) {
                    new = i;
                } else {
                    idx = deq.idx.load(Ordering::Acquire);
                }
                i += 1;
            }

            if new != 0 {
                match deq
                    .idx
                    .compare_exchange(idx, new, Ordering::Release, Ordering::Acquire)
                {
                    Ok(_) => idx = new,
                    Err(cur) => idx = cur,
                }
                if idx >= new {
                    new = 0;
                }
            }

            if idx < 0 || deq.id.load(Ordering::Relaxed) != id {
                break;
            }

            let c = self.find_cell(&dp, idx, th);
            let cell = unsafe { &*c };
            let claimed = cell.val.load(Ordering::Relaxed) == top()
                || match cell.deq.compare_exchange(
                    ptr::null_mut(),
                    deq_ptr,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => true,
                    Err(cur) => cur == deq_ptr,
                };
            if claimed {
                let _ = deq
                    .idx
                    .compare_exchange(idx, -idx, Ordering::Relaxed, Ordering::Relaxed);
                break;
            }

            old = idx;
            if idx >= i {
                i = idx + 1;
            }
        }
    }

    fn deq_fast(&self, th: &Handle, id: &mut i64) -> *mut u8 {
        let i = self.di.fetch_add(1, Ordering::SeqCst);
        let c = self.find_cell(&th.dp, i, th);
        let v = self.help_enq(th, c, i);
        if v == BOT {
            return BOT;
        }
        let cell = unsafe { &*c };
        if v != top()
            && cell
                .deq
                .compare_exchange(ptr::null_mut(), top(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return v;
        }
        *id = i;
        top()
    }

    fn deq_slow(&self, th: &Handle, id: i64) -> *mut u8 {
        let deq = &th.dr;
        deq.id.store(id, Ordering::Release);
        deq.idx.store(id, Ordering::Release);

        self.help_deq(th, th);
        let i = -deq.idx.load(Ordering::Relaxed);
        let c = self.find_cell(&th.dp, i, th);
        let val = unsafe { (*c).val.load(Ordering::Relaxed) };

        if val == top() {
            BOT
        } else {
            val
        }
    }

    /// Advance `cur` back to the oldest node `p_hzd`'s owner may still be
    /// traversing.
    fn check(p_hzd: &AtomicU64, mut cur: *mut Node, old: *mut Node) -> *mut Node {
        let hzd = p_hzd.load(Ordering::Acquire);
        unsafe {
            if hzd < (*cur).id as u64 {
                let mut tmp = old;
                while ((*tmp).id as u64) < hzd {
                    tmp = (*tmp).next.load(Ordering::Relaxed);
                }
                cur = tmp;
            }
        }
        cur
    }

    /// Swing a handle's node pointer forward to `cur`, then account for the
    /// hazard it advertises.
    fn update(
        p_node: &AtomicPtr<Node>,
        mut cur: *mut Node,
        p_hzd: &AtomicU64,
        old: *mut Node,
    ) -> *mut Node {
        let node = p_node.load(Ordering::Acquire);
        unsafe {
            if (*node).id < (*cur).id {
                if let Err(found) =
                    p_node.compare_exchange(node, cur, Ordering::SeqCst, Ordering::SeqCst)
                {
                    if (*found).id < (*cur).id {
                        cur = found;
                    }
                }
                cur = Self::check(p_hzd, cur, old);
            }
        }
        cur
    }

    /// Free nodes no handle can reach anymore.
    fn cleanup(&self, th: &Handle) {
        let oid = self.hi.load(Ordering::Acquire);
        let mut new = th.dp.load(Ordering::Relaxed);

        if oid == -1 {
            return;
        }
        if unsafe { (*new).id } - oid < (2 * self.nprocs) as i64 {
            return;
        }
        if self
            .hi
            .compare_exchange(oid, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let old = self.hp.load(Ordering::Relaxed);
        let th_ptr = th as *const Handle as *mut Handle;
        let mut ph = th_ptr;
        let mut phs: Vec<*mut Handle> = Vec::with_capacity(self.nprocs);

        loop {
            let handle = unsafe { &*ph };
            new = Self::check(&handle.hzd_node_id, new, old);
            new = Self::update(&handle.ep, new, &handle.hzd_node_id, old);
            new = Self::update(&handle.dp, new, &handle.hzd_node_id, old);
            phs.push(ph);
            ph = handle.next.get();
            if !(unsafe { (*new).id } > oid && ph != th_ptr) {
                break;
            }
        }
        while unsafe { (*new).id } > oid {
            match phs.pop() {
                Some(ph) => {
                    let handle = unsafe { &*ph };
                    new = Self::check(&handle.hzd_node_id, new, old);
                }
                None => break,
            }
        }

        let nid = unsafe { (*new).id };
        if nid <= oid {
            self.hi.store(oid, Ordering::Release);
        } else {
            self.hp.store(new, Ordering::Relaxed);
            self.hi.store(nid, Ordering::Release);
            let mut cur = old;
            while cur != new {
                let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
                unsafe { Node::free(cur) };
                cur = next;
            }
        }
    }
}

impl<T: Send> Default for WfQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WfQueue<T> {
    fn drop(&mut self) {
        // Drop values that were enqueued but never claimed by a dequeue: a
        // cell holds one exactly when its value is a real pointer and its
        // dequeue descriptor is still unset.
        let mut cur = self.hp.load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            for cell in node.cells.iter() {
                let v = cell.val.load(Ordering::Relaxed);
                if v != BOT && v != top() && cell.deq.load(Ordering::Relaxed).is_null() {
                    drop(unsafe { Box::from_raw(v as *mut T) });
                }
            }
            let next = node.next.load(Ordering::Relaxed);
            unsafe { Node::free(cur) };
            cur = next;
        }
        for handle in self.handles.iter() {
            let spare = handle.spare.get();
            if !spare.is_null() {
                unsafe { Node::free(spare) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = WfQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_cross_node_boundary() {
        let q = WfQueue::new();
        let count = 2 * NODE_SIZE + 5;
        for i in 0..count {
            q.enqueue(i);
        }
        for i in 0..count {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_drop_with_elements() {
        let q = WfQueue::new();
        q.enqueue(String::from("a"));
        q.enqueue(String::from("b"));
        assert_eq!(q.dequeue(), Some(String::from("a")));
    }

    #[test]
    fn test_mpmc_no_loss() {
        const NPRODUCERS: usize = 2;
        const NCONSUMERS: usize = 2;
        const NITEMS: usize = 20_000;

        let q = Arc::new(WfQueue::new());
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..NPRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..NITEMS {
                        q.enqueue(p * NITEMS + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..NCONSUMERS)
            .map(|_| {
                let q = Arc::clone(&q);
                let consumed = Arc::clone(&consumed);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while consumed.load(Ordering::Relaxed) < NPRODUCERS * NITEMS {
                        if let Some(v) = q.dequeue() {
                            got.push(v);
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    got
                })
            })
            .collect();

        for h in producers {
            h.join().unwrap();
        }
        let mut seen = vec![false; NPRODUCERS * NITEMS];
        for h in consumers {
            for v in h.join().unwrap() {
                assert!(!seen[v]);
                seen[v] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_per_producer_order() {
        const NITEMS: usize = 30_000;

        let q = Arc::new(WfQueue::new());
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
