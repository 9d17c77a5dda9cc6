//! Topology adapter: thread identifiers and NUMA hierarchy description.
//!
//! The locks and queues in this crate only need two things from the
//! platform: a stable numeric identifier per thread in `[0, max_threads)`,
//! and an immutable description of how many participants share each level of
//! the NUMA hierarchy. Discovering the real hardware tree and pinning
//! threads to execution contexts is the job of an external inspector; this
//! module hands out identifiers, synthesizes a plausible default hierarchy
//! from the hardware-thread count, and parses the environment knobs that
//! override it.
//!
//! Thread identifiers are claimed lazily on a thread's first interaction
//! with an identifier-indexed primitive and are returned to the allocator
//! when the thread exits, so a bounded slot table serves an unbounded
//! sequence of short-lived threads.

use std::cell::Cell;
use std::sync::OnceLock;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::spin::SpinGuarded;

/// Floor on the participant bound so that identifier-indexed structures can
/// host more workers than a small machine has hardware threads.
const MIN_PARTICIPANTS: usize = 64;

/// Default HMCS cohort threshold.
pub const DEFAULT_THRESHOLD: u32 = 256;

/// Default number of hierarchy levels.
const DEFAULT_MAX_LEVELS: usize = 3;

/// Upper bound on the number of participating threads.
///
/// Per-thread tables (MCS context-less nodes, combiner tnodes, wait-free
/// queue handles) are sized by this value.
pub fn max_threads() -> usize {
    static MAX_THREADS: OnceLock<usize> = OnceLock::new();
    *MAX_THREADS.get_or_init(|| num_cpus::get().max(MIN_PARTICIPANTS))
}

struct IdSlots {
    busy: Vec<bool>,
}

fn id_slots() -> &'static SpinGuarded<IdSlots> {
    static SLOTS: OnceLock<SpinGuarded<IdSlots>> = OnceLock::new();
    SLOTS.get_or_init(|| {
        SpinGuarded::new(IdSlots {
            busy: vec![false; max_threads()],
        })
    })
}

struct BoundId(Cell<Option<usize>>);

impl Drop for BoundId {
    fn drop(&mut self) {
        if let Some(id) = self.0.get() {
            let mut slots = id_slots().acquire();
            slots.busy[id] = false;
        }
    }
}

thread_local! {
    static THREAD_ID: BoundId = const { BoundId(Cell::new(None)) };
}

/// The calling thread's identifier in `[0, max_threads())`.
///
/// Claimed on first use and held until the thread exits. Panics if more than
/// `max_threads()` threads are simultaneously bound, which violates the
/// participation model.
pub fn thread_id() -> usize {
    THREAD_ID.with(|slot| match slot.0.get() {
        Some(id) => id,
        None => {
            let id = claim_id();
            slot.0.set(Some(id));
            id
        }
    })
}

fn claim_id() -> usize {
    let mut slots = id_slots().acquire();
    for (id, busy) in slots.busy.iter_mut().enumerate() {
        if !*busy {
            *busy = true;
            trace!("thread id {} claimed", id);
            return id;
        }
    }
    panic!(
        "more than {} threads bound simultaneously",
        slots.busy.len()
    );
}

/// Configuration for hierarchy construction.
///
/// Values are normally taken from the environment once at init:
///
/// - `HMCS_MAX_LEVELS`: number of hierarchy levels (default 3)
/// - `HMCS_EXPLICIT_LEVELS`: comma-separated participant counts, ascending,
///   innermost level first; the last must equal the hardware-thread bound
/// - `HMCS_THRESHOLD`: cohort length bound per level (default 256)
#[derive(Debug, Clone)]
pub struct HmcsConfig {
    /// Number of levels to synthesize when no explicit shape is given.
    pub max_levels: usize,
    /// Explicit participant counts per level, innermost first.
    pub explicit_levels: Option<Vec<usize>>,
    /// Cohort length bound per level.
    pub threshold: u32,
}

impl Default for HmcsConfig {
    fn default() -> Self {
        Self {
            max_levels: DEFAULT_MAX_LEVELS,
            explicit_levels: None,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl HmcsConfig {
    /// Read the configuration knobs from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(s) = std::env::var("HMCS_MAX_LEVELS") {
            if let Ok(n) = s.trim().parse::<usize>() {
                if n >= 1 {
                    config.max_levels = n;
                }
            }
        }
        if let Ok(s) = std::env::var("HMCS_EXPLICIT_LEVELS") {
            let parsed: std::result::Result<Vec<usize>, _> =
                s.split(',').map(|tok| tok.trim().parse::<usize>()).collect();
            if let Ok(levels) = parsed {
                if !levels.is_empty() {
                    config.explicit_levels = Some(levels);
                }
            }
        }
        if let Ok(s) = std::env::var("HMCS_THRESHOLD") {
            if let Ok(n) = s.trim().parse::<u32>() {
                if n >= 1 {
                    config.threshold = n;
                }
            }
        }
        config
    }
}

/// An immutable NUMA hierarchy: participant counts per level, innermost
/// level first, outermost equal to the thread bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    participants: Vec<usize>,
}

impl Hierarchy {
    /// Build a hierarchy from explicit participant counts.
    ///
    /// Counts must be ascending, each must divide the next, and the last
    /// must equal `max_threads`.
    pub fn from_participants(participants: Vec<usize>, max_threads: usize) -> Result<Self> {
        if participants.is_empty() {
            return Err(Error::InvalidTopology("no levels"));
        }
        if *participants.last().unwrap() != max_threads {
            return Err(Error::InvalidTopology(
                "outermost participant count must equal the thread bound",
            ));
        }
        for pair in participants.windows(2) {
            if pair[0] == 0 || pair[1] % pair[0] != 0 {
                return Err(Error::InvalidTopology(
                    "each level's participant count must divide the next",
                ));
            }
        }
        if participants[0] == 0 {
            return Err(Error::InvalidTopology("zero participants at a level"));
        }
        Ok(Self { participants })
    }

    /// Synthesize a hierarchy for `max_threads` participants from `config`.
    ///
    /// With no explicit shape, splits into up to `max_levels` levels of the
    /// form `[2, max/2, max]`, falling back to fewer levels when the counts
    /// do not divide.
    pub fn detect(config: &HmcsConfig, max_threads: usize) -> Result<Self> {
        if let Some(explicit) = &config.explicit_levels {
            let h = Self::from_participants(explicit.clone(), max_threads)?;
            debug!("hmcs hierarchy (explicit): {:?}", h.participants);
            return Ok(h);
        }
        let participants = if config.max_levels >= 3 && max_threads % 4 == 0 {
            vec![2, max_threads / 2, max_threads]
        } else if config.max_levels >= 2 && max_threads % 2 == 0 {
            vec![2, max_threads]
        } else {
            vec![max_threads]
        };
        debug!("hmcs hierarchy (synthesized): {:?}", participants);
        Self::from_participants(participants, max_threads)
    }

    /// Number of levels.
    #[inline]
    pub fn levels(&self) -> usize {
        self.participants.len()
    }

    /// Participant count at `level` (0 = innermost).
    #[inline]
    pub fn participants_at(&self, level: usize) -> usize {
        self.participants[level]
    }

    /// Total participant bound (outermost count).
    #[inline]
    pub fn max_threads(&self) -> usize {
        *self.participants.last().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        assert!(a < max_threads());
    }

    #[test]
    fn test_thread_ids_distinct() {
        let mine = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(mine, other);
    }

    #[test]
    fn test_id_released_on_exit() {
        // Sequentially exiting threads must not leak slots: a long run of
        // short-lived threads stays within the bound.
        for _ in 0..3 * max_threads() {
            let id = std::thread::spawn(thread_id).join().unwrap();
            assert!(id < max_threads());
        }
    }

    #[test]
    fn test_hierarchy_explicit_valid() {
        let h = Hierarchy::from_participants(vec![2, 4, 8], 8).unwrap();
        assert_eq!(h.levels(), 3);
        assert_eq!(h.participants_at(0), 2);
        assert_eq!(h.max_threads(), 8);
    }

    #[test]
    fn test_hierarchy_rejects_non_dividing() {
        assert!(Hierarchy::from_participants(vec![3, 8], 8).is_err());
        assert!(Hierarchy::from_participants(vec![2, 4], 8).is_err());
        assert!(Hierarchy::from_participants(vec![], 8).is_err());
    }

    #[test]
    fn test_hierarchy_detect_default() {
        let config = HmcsConfig::default();
        let h = Hierarchy::detect(&config, 8).unwrap();
        assert_eq!(h.max_threads(), 8);
        assert!(h.levels() >= 1);
    }

    #[test]
    fn test_hierarchy_detect_single_level() {
        let config = HmcsConfig {
            max_levels: 1,
            ..Default::default()
        };
        let h = Hierarchy::detect(&config, 7).unwrap();
        assert_eq!(h.levels(), 1);
    }

    #[test]
    fn test_config_default() {
        let c = HmcsConfig::default();
        assert_eq!(c.max_levels, 3);
        assert_eq!(c.threshold, DEFAULT_THRESHOLD);
        assert!(c.explicit_levels.is_none());
    }
}
