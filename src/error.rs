//! Error taxonomy for construction and teardown paths.
//!
//! Acquire, release, enqueue, and dequeue never fail in steady state; only
//! initialization and destruction report errors. `try_acquire` variants
//! report contention through their return value, not through this type.

use thiserror::Error;

/// Errors reported by constructors and destructors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A backing allocation failed.
    #[error("allocation failed")]
    AllocFailed,

    /// The supplied NUMA hierarchy is malformed: participant counts must be
    /// ascending, each must divide the next, and the outermost count must
    /// equal the hardware-thread count.
    #[error("invalid topology: {0}")]
    InvalidTopology(&'static str),

    /// The bucket count of a bucketed queue must be a positive multiple of
    /// the summary word width in bytes.
    #[error("invalid bucket count {0}: must be a positive multiple of {1}")]
    InvalidBucketCount(usize, usize),
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::AllocFailed.to_string(), "allocation failed");
        assert!(Error::InvalidBucketCount(3, 8).to_string().contains("3"));
    }
}
