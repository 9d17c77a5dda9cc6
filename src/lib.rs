//! # numakit
//!
//! Shared-memory synchronization primitives and concurrent data structures
//! for many-core NUMA systems: a family of mutual-exclusion locks from
//! ticket locks up to hierarchical NUMA-aware queue locks with priority
//! extensions, combining-synchronization constructs, a spectrum of
//! concurrent FIFO queues (lock-based, lock-free, and wait-free), and the
//! thread-cached memory pool that feeds them.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`pr`] - Atomic operations and memory-ordering vocabulary
//! - [`error`] - Status taxonomy for init/destroy paths
//! - [`topo`] - Thread identifiers and NUMA hierarchy description
//!
//! ### Building Blocks
//! - [`spin`] - Spin-guarded cold-path state
//! - [`pool`] - Thread-cached fixed-element-size memory pool
//! - [`hazard`] - Hazard-pointer memory reclamation
//!
//! ### Locks
//! - [`ticket`] - FIFO ticket lock
//! - [`mcs`] - MCS queue lock (contextful and context-less)
//! - [`hmcs`] - Hierarchical MCS with cohort passing and a fast path
//!
//! ### Combining
//! - [`dsm`] - DSM-Synch combining lock
//! - [`ccsync`] - CC-Synch combining lock
//!
//! ### Priority Composition
//! - [`mcsp`] - MCS high/low pair with a ticket filter
//! - [`tlp`] - Two-level priority lock generic over its slot locks
//! - [`hmpr`] - Hierarchical MCS with low-priority deferral
//!
//! ### Queues
//! - [`glqueue`] - Global-lock queue
//! - [`swpqueue`] - Swap-based MPSC queue
//! - [`msqueue`] - Michael–Scott lock-free MPMC queue
//! - [`faqueue`] - Fetch-add segment queue (strict FIFO, MPSC)
//! - [`mpbqueue`] - Bucketed multi-producer queue with summary scan
//! - [`dsmqueue`] - Combining-based FIFO queue
//! - [`wfqueue`] - Wait-free MPMC queue

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Status taxonomy for init and destroy paths.
pub mod error;

/// Atomic operations and memory-ordering vocabulary.
pub mod pr;

// =============================================================================
// Tier 1: Building Blocks (Depends on Tier 0)
// =============================================================================

/// Spin-guarded cold-path state.
pub mod spin;

/// Thread identifiers and NUMA hierarchy description.
pub mod topo;

/// Hazard-pointer memory reclamation.
pub mod hazard;

/// Thread-cached fixed-element-size memory pool.
pub mod pool;

// =============================================================================
// Tier 2: Locks (Depends on Tiers 0-1)
// =============================================================================

/// FIFO ticket lock.
pub mod ticket;

/// MCS queue lock.
pub mod mcs;

/// Hierarchical MCS lock.
pub mod hmcs;

/// DSM-Synch combining lock.
pub mod dsm;

/// CC-Synch combining lock.
pub mod ccsync;

/// MCS-based priority lock pair.
pub mod mcsp;

/// Two-level priority lock over configurable slot locks.
pub mod tlp;

/// Hierarchical MCS lock with priority deferral.
pub mod hmpr;

// =============================================================================
// Tier 3: Queues (Depends on Tiers 0-2)
// =============================================================================

/// Global-lock queue.
pub mod glqueue;

/// Swap-based MPSC queue.
pub mod swpqueue;

/// Michael–Scott lock-free queue.
pub mod msqueue;

/// Fetch-add segment queue.
pub mod faqueue;

/// Bucketed multi-producer queue.
pub mod mpbqueue;

/// Combining FIFO queue.
pub mod dsmqueue;

/// Wait-free MPMC queue.
pub mod wfqueue;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use error::{Error, Result};
pub use hmcs::HmcsLock;
pub use mcs::{CsvMcsLock, McsLock, McsNode};
pub use pool::Pool;
pub use ticket::TicketLock;
pub use topo::{Hierarchy, HmcsConfig};
