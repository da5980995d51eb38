use thiserror::Error;

/// Errors that can occur when creating an [`Allocator`][crate::Allocator].
///
/// Allocation itself never fails with an error - an exhausted pool or heap is reported
/// as `None` from the acquire methods so the caller can retry, drop the item or fall back
/// to a different allocation path.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested pool geometry cannot be used.
    #[error("invalid allocator configuration: {problem}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The system allocator could not provide memory for one of the initial blocks.
    ///
    /// Any blocks allocated before the failing one have already been released again.
    #[error("failed to allocate memory block {index} of {count} ({bytes} bytes)")]
    BlockAllocationFailed {
        /// Zero-based index of the block that could not be allocated.
        index: usize,

        /// How many blocks were requested in total.
        count: usize,

        /// Size of the failed allocation, including the block header.
        bytes: usize,
    },
}

/// A specialized `Result` type for allocator setup, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn messages_name_the_problem() {
        let error = Error::InvalidConfiguration {
            problem: "chunk size 12 is not a multiple of 8".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "invalid allocator configuration: chunk size 12 is not a multiple of 8"
        );

        let error = Error::BlockAllocationFailed {
            index: 2,
            count: 4,
            bytes: 4160,
        };
        assert_eq!(
            error.to_string(),
            "failed to allocate memory block 2 of 4 (4160 bytes)"
        );
    }
}
