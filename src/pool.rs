//! Thread-cached fixed-element-size memory pool.
//!
//! Queue nodes are small, fixed-size, and allocated and freed at line rate,
//! so the pool keeps a per-thread cache of free elements and only touches
//! shared state when the cache empties or fills: elements move between the
//! thread-local pool and a spinlocked global pool a block (1024 elements) at
//! a time.
//!
//! A pool handle is a small index into a process-global registry rather
//! than a pointer, so per-thread state is a lazily grown array slot instead
//! of a structure that has to know about every pool. Registry reads are
//! lock-free (a load-acquire of the current snapshot); writers copy-on-grow
//! under a spinlock and retire old snapshots rather than freeing them out
//! from under readers.
//!
//! Element layout is `| next | payload |` with the payload starting on its
//! own cache line; while an element is allocated the pool never touches any
//! of its bytes.
//!
//! The `page-alloc` feature switches the global refill policy from
//! per-element heap allocation (freed back to the heap when the global pool
//! overfills) to carving elements out of 4 MiB pages that are only returned
//! when the pool is destroyed.

use core::cell::RefCell;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

use log::debug;

use crate::error::{Error, Result};
use crate::spin::SpinGuarded;

const CACHELINE: usize = 64;

const BLOCKSIZE_LOG: usize = 10;
/// Elements per block.
pub const BLOCKSIZE: usize = 1 << BLOCKSIZE_LOG;
/// Blocks held by a thread-local pool.
pub const LOCALPOOL_NUM_BLOCKS: usize = 2;
/// Blocks moved global -> local on a refill. Must be below the local
/// capacity.
pub const GLOBAL_TO_LOCAL_NUM_BLOCKS: usize = 1;
/// Blocks moved local -> global on a spill. Must be below the local
/// capacity.
pub const LOCAL_TO_GLOBAL_NUM_BLOCKS: usize = 1;

/// Global pool trim threshold in blocks (heap mode only).
#[cfg(not(feature = "page-alloc"))]
const GLOBALPOOL_NUM_BLOCKS: usize = 16;

/// Carve size for page mode.
#[cfg(feature = "page-alloc")]
const PAGESIZE: usize = 4 * 1024 * 1024;

/// Element header: the intrusive free-list link. The user payload starts at
/// the next cache line.
#[repr(C)]
struct Element {
    next: *mut Element,
}

const HEADER: usize = CACHELINE;

#[inline]
fn element_to_ptr(element: *mut Element) -> *mut u8 {
    unsafe { (element as *mut u8).add(HEADER) }
}

#[inline]
fn ptr_to_element(ptr: *mut u8) -> *mut Element {
    unsafe { ptr.sub(HEADER) as *mut Element }
}

/// A run of up to [`BLOCKSIZE`] elements linked through their headers.
#[derive(Clone, Copy)]
struct Block {
    num_elements: usize,
    head: *mut Element,
    tail: *mut Element,
}

impl Block {
    const EMPTY: Block = Block {
        num_elements: 0,
        head: ptr::null_mut(),
        tail: ptr::null_mut(),
    };
}

struct LocalPool {
    num_elements: usize,
    /// Full element footprint, mirrored from the global pool so teardown
    /// does not need a registry lookup.
    alloc_size: usize,
    blocks: [Block; LOCALPOOL_NUM_BLOCKS],
}

impl LocalPool {
    fn new(alloc_size: usize) -> Box<LocalPool> {
        Box::new(LocalPool {
            num_elements: 0,
            alloc_size,
            blocks: [Block::EMPTY; LOCALPOOL_NUM_BLOCKS],
        })
    }
}

#[cfg(feature = "page-alloc")]
#[repr(C)]
struct Bulk {
    next: *mut Bulk,
}

struct GlobalInner {
    num_elements: usize,
    blocks: Vec<Block>,
    #[cfg(feature = "page-alloc")]
    bulks: *mut Bulk,
}

struct GlobalPool {
    entry_index: usize,
    element_size: usize,
    /// Full element footprint: header plus payload, rounded to a cache
    /// line.
    alloc_size: usize,
    inner: SpinGuarded<GlobalInner>,
}

unsafe impl Send for GlobalPool {}
unsafe impl Sync for GlobalPool {}

// ---------------------------------------------------------------------------
// Registry: lock-free reads of an extensible snapshot array.
// ---------------------------------------------------------------------------

struct Snapshot {
    values: Box<[AtomicPtr<GlobalPool>]>,
}

static SNAPSHOT: AtomicPtr<Snapshot> = AtomicPtr::new(ptr::null_mut());

struct Manager {
    entry_busy: Vec<bool>,
    thread_entries: Vec<*mut ThreadEntry>,
    /// Superseded snapshots; readers may still hold references, so they are
    /// kept until process end (growth is logarithmic).
    retired_snapshots: Vec<*mut Snapshot>,
}

unsafe impl Send for Manager {}

fn manager() -> &'static SpinGuarded<Manager> {
    static MANAGER: std::sync::OnceLock<SpinGuarded<Manager>> = std::sync::OnceLock::new();
    MANAGER.get_or_init(|| {
        SpinGuarded::new(Manager {
            entry_busy: Vec::new(),
            thread_entries: Vec::new(),
            retired_snapshots: Vec::new(),
        })
    })
}

/// Look up a pool by entry index without taking any lock.
#[inline]
fn global_pool(entry_index: usize) -> *mut GlobalPool {
    let snapshot = SNAPSHOT.load(Ordering::Acquire);
    if snapshot.is_null() {
        return ptr::null_mut();
    }
    let snapshot = unsafe { &*snapshot };
    match snapshot.values.get(entry_index) {
        Some(slot) => slot.load(Ordering::Acquire),
        None => ptr::null_mut(),
    }
}

/// Publish `value` at `entry_index`, growing the snapshot if needed. Caller
/// holds the manager lock.
fn publish_pool(mgr: &mut Manager, entry_index: usize, value: *mut GlobalPool) {
    let old = SNAPSHOT.load(Ordering::Acquire);
    let old_len = if old.is_null() {
        0
    } else {
        unsafe { (&(*old).values).len() }
    };
    if entry_index >= old_len {
        let new_len = (old_len * 2).max(entry_index + 1).max(8);
        let values: Box<[AtomicPtr<GlobalPool>]> = (0..new_len)
            .map(|i| {
                let prev = if i < old_len {
                    unsafe { (*old).values[i].load(Ordering::Acquire) }
                } else {
                    ptr::null_mut()
                };
                AtomicPtr::new(prev)
            })
            .collect();
        let fresh = Box::into_raw(Box::new(Snapshot { values }));
        SNAPSHOT.store(fresh, Ordering::Release);
        if !old.is_null() {
            mgr.retired_snapshots.push(old);
        }
        debug!("pool registry grown to {} entries", new_len);
    }
    let snapshot = unsafe { &*SNAPSHOT.load(Ordering::Acquire) };
    snapshot.values[entry_index].store(value, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Per-thread local pools.
// ---------------------------------------------------------------------------

struct ThreadEntry {
    local_pools: Vec<Option<Box<LocalPool>>>,
}

struct ThreadEntryHolder(RefCell<*mut ThreadEntry>);

impl Drop for ThreadEntryHolder {
    fn drop(&mut self) {
        let entry = *self.0.borrow();
        if entry.is_null() {
            return;
        }
        {
            let mut mgr = manager().acquire();
            mgr.thread_entries.retain(|&e| e != entry);
        }
        let mut entry = unsafe { Box::from_raw(entry) };
        for local in entry.local_pools.iter_mut() {
            if let Some(local) = local.take() {
                free_local_pool(local);
            }
        }
    }
}

thread_local! {
    static THREAD_ENTRY: ThreadEntryHolder = ThreadEntryHolder(RefCell::new(ptr::null_mut()));
}

/// Drop a local pool, releasing its elements. In heap mode the elements go
/// back to the allocator; in page mode they belong to the global pool's
/// pages and only the bookkeeping is dropped.
fn free_local_pool(local: Box<LocalPool>) {
    #[cfg(not(feature = "page-alloc"))]
    {
        let block_count = local.num_elements.div_ceil(BLOCKSIZE);
        for block in local.blocks.iter().take(block_count) {
            free_block_elements(block, local.alloc_size);
        }
    }
    #[cfg(feature = "page-alloc")]
    let _ = local;
}

#[cfg(not(feature = "page-alloc"))]
fn free_block_elements(block: &Block, alloc_size: usize) {
    let layout = Layout::from_size_align(alloc_size, CACHELINE).unwrap();
    let mut element = block.head;
    while !element.is_null() {
        let next = unsafe { (*element).next };
        unsafe { dealloc(element as *mut u8, layout) };
        element = next;
    }
}

/// The calling thread's local pool for `entry_index`, created on first use.
fn local_pool(entry_index: usize, alloc_size: usize) -> *mut LocalPool {
    THREAD_ENTRY.with(|holder| {
        let mut slot = holder.0.borrow_mut();
        if slot.is_null() {
            let entry = Box::into_raw(Box::new(ThreadEntry {
                local_pools: Vec::new(),
            }));
            manager().acquire().thread_entries.push(entry);
            *slot = entry;
        }
        let entry = unsafe { &mut **slot };
        if entry.local_pools.len() <= entry_index {
            // Grown under the manager lock so that a concurrent destroy
            // never walks a reallocating vector.
            let _mgr = manager().acquire();
            entry.local_pools.resize_with(entry_index + 1, || None);
        }
        let local = &mut entry.local_pools[entry_index];
        if local.is_none() {
            *local = Some(LocalPool::new(alloc_size));
        }
        local.as_mut().unwrap().as_mut() as *mut LocalPool
    })
}

// ---------------------------------------------------------------------------
// Pool operations.
// ---------------------------------------------------------------------------

/// A handle to a fixed-element-size pool. Cheap to copy; all state lives in
/// the registry and per-thread caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    entry_index: usize,
}

impl Pool {
    /// Create a pool whose elements carry `element_size` bytes of payload.
    pub fn new(element_size: usize) -> Result<Pool> {
        let alloc_size = (HEADER + element_size + CACHELINE - 1) & !(CACHELINE - 1);
        let mut mgr = manager().acquire();
        let entry_index = match mgr.entry_busy.iter().position(|&b| !b) {
            Some(i) => i,
            None => {
                mgr.entry_busy.push(false);
                mgr.entry_busy.len() - 1
            }
        };
        mgr.entry_busy[entry_index] = true;

        let pool = Box::into_raw(Box::new(GlobalPool {
            entry_index,
            element_size,
            alloc_size,
            inner: SpinGuarded::new(GlobalInner {
                num_elements: 0,
                blocks: Vec::new(),
                #[cfg(feature = "page-alloc")]
                bulks: ptr::null_mut(),
            }),
        }));
        publish_pool(&mut mgr, entry_index, pool);
        debug!(
            "pool {} created: payload {} bytes, element {} bytes",
            entry_index, element_size, alloc_size
        );
        Ok(Pool { entry_index })
    }

    /// The payload size this pool serves.
    pub fn element_size(&self) -> Result<usize> {
        let pool = global_pool(self.entry_index);
        if pool.is_null() {
            return Err(Error::AllocFailed);
        }
        Ok(unsafe { (*pool).element_size })
    }

    /// Allocate one element, refilling the thread-local cache from the
    /// global pool when empty.
    pub fn alloc(&self) -> Result<*mut u8> {
        let pool = global_pool(self.entry_index);
        if pool.is_null() {
            return Err(Error::AllocFailed);
        }
        let pool = unsafe { &*pool };
        let local = local_pool(self.entry_index, pool.alloc_size);
        let local = unsafe { &mut *local };
        if local.num_elements == 0 {
            refill_local(pool, local)?;
        }
        // Unlink from the head of the current block.
        local.num_elements -= 1;
        let block_i = local.num_elements >> BLOCKSIZE_LOG;
        let block = &mut local.blocks[block_i];
        let element = block.head;
        block.head = unsafe { (*element).next };
        block.num_elements -= 1;
        Ok(element_to_ptr(element))
    }

    /// Return one element, spilling a block to the global pool when the
    /// thread-local cache is full.
    pub fn free(&self, ptr: *mut u8) {
        let pool = global_pool(self.entry_index);
        debug_assert!(!pool.is_null());
        let pool = unsafe { &*pool };
        let local = local_pool(self.entry_index, pool.alloc_size);
        let local = unsafe { &mut *local };
        if local.num_elements == LOCALPOOL_NUM_BLOCKS * BLOCKSIZE {
            spill_local(pool, local);
        }
        let block_i = local.num_elements >> BLOCKSIZE_LOG;
        local.num_elements += 1;
        let block = &mut local.blocks[block_i];
        let element = ptr_to_element(ptr);
        if block.num_elements == 0 {
            block.head = element;
            block.tail = element;
            unsafe { (*element).next = ptr::null_mut() };
        } else {
            unsafe { (*element).next = block.head };
            block.head = element;
        }
        block.num_elements += 1;
    }

    /// Destroy the pool: every thread's local cache for this entry and the
    /// global reserve are released, and the entry index is recycled.
    ///
    /// The caller must guarantee that no thread still uses the pool and
    /// that every allocated element has been freed.
    pub fn destroy(self) {
        let mut mgr = manager().acquire();
        let pool = global_pool(self.entry_index);
        if pool.is_null() {
            return;
        }
        // Release every thread's local pool for this entry.
        for &entry in mgr.thread_entries.iter() {
            let entry = unsafe { &mut *entry };
            if let Some(slot) = entry.local_pools.get_mut(self.entry_index) {
                if let Some(local) = slot.take() {
                    free_local_pool(local);
                }
            }
        }

        let pool = unsafe { Box::from_raw(pool) };
        {
            let inner = pool.inner.acquire();
            #[cfg(not(feature = "page-alloc"))]
            {
                let block_count = inner.num_elements.div_ceil(BLOCKSIZE);
                for block in inner.blocks.iter().take(block_count) {
                    free_block_elements(block, pool.alloc_size);
                }
            }
            #[cfg(feature = "page-alloc")]
            {
                let layout = Layout::from_size_align(PAGESIZE, CACHELINE).unwrap();
                let mut bulk = inner.bulks;
                while !bulk.is_null() {
                    let next = unsafe { (*bulk).next };
                    unsafe { dealloc(bulk as *mut u8, layout) };
                    bulk = next;
                }
            }
        }

        let snapshot = unsafe { &*SNAPSHOT.load(Ordering::Acquire) };
        snapshot.values[pool.entry_index].store(ptr::null_mut(), Ordering::Release);
        mgr.entry_busy[pool.entry_index] = false;
        debug!("pool {} destroyed", pool.entry_index);

        // With no pool left registered there can be no registry readers, so
        // the snapshot chain can finally be reclaimed.
        if mgr.entry_busy.iter().all(|&b| !b) {
            let snap = SNAPSHOT.swap(ptr::null_mut(), Ordering::AcqRel);
            if !snap.is_null() {
                drop(unsafe { Box::from_raw(snap) });
            }
            for retired in mgr.retired_snapshots.drain(..) {
                drop(unsafe { Box::from_raw(retired) });
            }
        }
    }
}

/// Move [`GLOBAL_TO_LOCAL_NUM_BLOCKS`] full blocks from the global pool into
/// an empty local pool, allocating fresh elements first if the global pool
/// runs low.
fn refill_local(pool: &GlobalPool, local: &mut LocalPool) -> Result<()> {
    let mut inner = pool.inner.acquire();
    while inner.num_elements < GLOBAL_TO_LOCAL_NUM_BLOCKS * BLOCKSIZE {
        grow_global(pool, &mut inner)?;
    }
    let global_block_i = inner.num_elements >> BLOCKSIZE_LOG;
    let from = global_block_i - GLOBAL_TO_LOCAL_NUM_BLOCKS;
    local.blocks[..GLOBAL_TO_LOCAL_NUM_BLOCKS]
        .copy_from_slice(&inner.blocks[from..global_block_i]);
    local.num_elements = GLOBAL_TO_LOCAL_NUM_BLOCKS * BLOCKSIZE;
    inner.num_elements -= GLOBAL_TO_LOCAL_NUM_BLOCKS * BLOCKSIZE;
    if inner.num_elements & (BLOCKSIZE - 1) != 0 {
        // A partial block sat above the taken ones; move it down.
        inner.blocks[from] = inner.blocks[global_block_i];
        clear_blocks(&mut inner.blocks, from + 1);
    } else {
        clear_blocks(&mut inner.blocks, from);
    }
    Ok(())
}

fn clear_blocks(blocks: &mut [Block], from: usize) {
    for block in blocks.iter_mut().skip(from) {
        *block = Block::EMPTY;
    }
}

/// Append a freshly allocated element to the global block array. Caller
/// tracks `num_elements`.
fn push_global_element(inner: &mut GlobalInner, element: *mut Element) {
    unsafe { (*element).next = ptr::null_mut() };
    let block_i = inner.num_elements >> BLOCKSIZE_LOG;
    if block_i >= inner.blocks.len() {
        let new_len = (inner.blocks.len() * 2).max(block_i + 1);
        inner.blocks.resize(new_len, Block::EMPTY);
    }
    let block = &mut inner.blocks[block_i];
    if block.num_elements == 0 {
        block.head = element;
        block.tail = element;
    } else {
        unsafe { (*block.tail).next = element };
        block.tail = element;
    }
    block.num_elements += 1;
    inner.num_elements += 1;
}

/// Obtain fresh memory for the global pool.
#[cfg(not(feature = "page-alloc"))]
fn grow_global(pool: &GlobalPool, inner: &mut GlobalInner) -> Result<()> {
    let layout = Layout::from_size_align(pool.alloc_size, CACHELINE).unwrap();
    while inner.num_elements < GLOBAL_TO_LOCAL_NUM_BLOCKS * BLOCKSIZE {
        let element = unsafe { alloc(layout) } as *mut Element;
        if element.is_null() {
            return Err(Error::AllocFailed);
        }
        push_global_element(inner, element);
    }
    Ok(())
}

#[cfg(feature = "page-alloc")]
fn grow_global(pool: &GlobalPool, inner: &mut GlobalInner) -> Result<()> {
    let layout = Layout::from_size_align(PAGESIZE, CACHELINE).unwrap();
    let mem = unsafe { alloc(layout) };
    if mem.is_null() {
        return Err(Error::AllocFailed);
    }
    let bulk = mem as *mut Bulk;
    unsafe { (*bulk).next = inner.bulks };
    inner.bulks = bulk;

    let mut offset = CACHELINE; // skip the bulk header's cache line
    while offset + pool.alloc_size <= PAGESIZE {
        let element = unsafe { mem.add(offset) } as *mut Element;
        push_global_element(inner, element);
        offset += pool.alloc_size;
    }
    Ok(())
}

/// Move [`LOCAL_TO_GLOBAL_NUM_BLOCKS`] full blocks from a full local pool to
/// the global pool, trimming the global reserve in heap mode.
fn spill_local(pool: &GlobalPool, local: &mut LocalPool) {
    {
        let mut inner = pool.inner.acquire();
        let needed_blocks = (inner.num_elements + BLOCKSIZE - 1 + LOCAL_TO_GLOBAL_NUM_BLOCKS * BLOCKSIZE)
            >> BLOCKSIZE_LOG;
        if inner.blocks.len() < needed_blocks {
            let new_len = (inner.blocks.len() * 2).max(needed_blocks);
            inner.blocks.resize(new_len, Block::EMPTY);
        }
        let block_i = inner.num_elements >> BLOCKSIZE_LOG;
        if inner.num_elements & (BLOCKSIZE - 1) != 0 {
            // Keep the partial block on top of the incoming full ones.
            inner.blocks[block_i + LOCAL_TO_GLOBAL_NUM_BLOCKS] = inner.blocks[block_i];
        }
        let src = LOCALPOOL_NUM_BLOCKS - LOCAL_TO_GLOBAL_NUM_BLOCKS;
        inner.blocks[block_i..block_i + LOCAL_TO_GLOBAL_NUM_BLOCKS]
            .copy_from_slice(&local.blocks[src..]);
        inner.num_elements += LOCAL_TO_GLOBAL_NUM_BLOCKS * BLOCKSIZE;

        #[cfg(not(feature = "page-alloc"))]
        if inner.num_elements > GLOBALPOOL_NUM_BLOCKS * BLOCKSIZE {
            let upto = inner.num_elements.div_ceil(BLOCKSIZE);
            for i in GLOBALPOOL_NUM_BLOCKS..upto {
                let block = inner.blocks[i];
                free_block_elements(&block, pool.alloc_size);
                inner.blocks[i] = Block::EMPTY;
            }
            inner.num_elements = GLOBALPOOL_NUM_BLOCKS * BLOCKSIZE;
        }
    }
    // Local bookkeeping outside the critical section.
    let src = LOCALPOOL_NUM_BLOCKS - LOCAL_TO_GLOBAL_NUM_BLOCKS;
    clear_blocks(&mut local.blocks, src);
    local.num_elements -= LOCAL_TO_GLOBAL_NUM_BLOCKS * BLOCKSIZE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn test_alloc_free_roundtrip() {
        let pool = Pool::new(16).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        unsafe {
            ptr::write_bytes(a, 0xa5, 16);
            ptr::write_bytes(b, 0x5a, 16);
            assert_eq!(*a, 0xa5);
            assert_eq!(*b, 0x5a);
        }
        pool.free(a);
        pool.free(b);
        pool.destroy();
    }

    #[test]
    fn test_payload_cache_aligned() {
        let pool = Pool::new(8).unwrap();
        let p = pool.alloc().unwrap();
        assert_eq!(p as usize % CACHELINE, 0);
        pool.free(p);
        pool.destroy();
    }

    #[test]
    fn test_refill_and_spill_cycle() {
        let pool = Pool::new(8).unwrap();
        // Drain through several refills, then return everything, crossing
        // the spill threshold.
        let mut ptrs = Vec::new();
        for _ in 0..3 * BLOCKSIZE {
            ptrs.push(pool.alloc().unwrap());
        }
        for p in ptrs.drain(..) {
            pool.free(p);
        }
        // And allocate again from the recycled elements.
        for _ in 0..BLOCKSIZE {
            ptrs.push(pool.alloc().unwrap());
        }
        for p in ptrs {
            pool.free(p);
        }
        pool.destroy();
    }

    // Multi-threaded hammer: random alloc/free bursts; every element is
    // tagged by its owner and verified on free.
    #[test]
    fn test_hammer_tagged_elements() {
        const NTHREADS: usize = 8;
        const MAX_OUTSTANDING: usize = 2_000;
        const NOPS: usize = 3_000;
        let element_sizes: &[usize] = &[1, 2, 4, 8, 16, 7, 5, 3, 64, 128, 256, 1024];

        for &element_size in element_sizes {
            let pool = Arc::new(Pool::new(element_size).unwrap());
            let handles: Vec<_> = (0..NTHREADS)
                .map(|tid| {
                    let pool = Arc::clone(&pool);
                    std::thread::spawn(move || {
                        let tag = (tid % 128) as u8;
                        let mut rng = rand::rngs::StdRng::seed_from_u64(tid as u64);
                        let mut ptrs: Vec<*mut u8> = Vec::with_capacity(MAX_OUTSTANDING);
                        for _ in 0..NOPS {
                            if rng.gen_bool(0.5) {
                                let burst = rng.gen_range(0..50);
                                for _ in 0..burst {
                                    if ptrs.len() == MAX_OUTSTANDING {
                                        break;
                                    }
                                    let p = pool.alloc().unwrap();
                                    unsafe { ptr::write_bytes(p, tag, element_size) };
                                    ptrs.push(p);
                                }
                            } else {
                                let burst = rng.gen_range(0..50).min(ptrs.len());
                                for _ in 0..burst {
                                    let p = ptrs.pop().unwrap();
                                    for i in 0..element_size {
                                        assert_eq!(unsafe { *p.add(i) }, tag);
                                    }
                                    pool.free(p);
                                }
                            }
                        }
                        for p in ptrs {
                            for i in 0..element_size {
                                assert_eq!(unsafe { *p.add(i) }, tag);
                            }
                            pool.free(p);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            Arc::try_unwrap(pool).unwrap().destroy();
        }
    }

    #[test]
    fn test_entry_index_recycled() {
        let a = Pool::new(8).unwrap();
        a.destroy();
        // The recycled registry slot must serve a fresh pool.
        let b = Pool::new(32).unwrap();
        let p = b.alloc().unwrap();
        unsafe { ptr::write_bytes(p, 0x11, 32) };
        b.free(p);
        b.destroy();
    }
}
