use std::fmt;

use thiserror::Error;

use crate::{Failure, PoolId};

/// Errors returned by allocator operations.
///
/// Every fallible operation reports one of these after first consulting the allocator's
/// [`FailurePolicy`][crate::FailurePolicy]. Use [`kind()`][Self::kind] to classify an error
/// without matching on its fields.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Every slot in the pool is allocated.
    ///
    /// This is recoverable: the caller may retry after releasing other handles.
    #[error("pool {pool_id} is exhausted: all {capacity} slots are allocated")]
    PoolExhausted {
        /// The pool that could not satisfy the allocation.
        pool_id: PoolId,

        /// The fixed slot count of the pool.
        capacity: usize,
    },

    /// A handle did not name a live allocation in the pool it was used with.
    #[error("invalid handle to slot {slot_index} of pool {pool_id}: {problem}")]
    InvalidHandle {
        /// The pool the handle was presented to.
        pool_id: PoolId,

        /// The slot index carried by the handle.
        slot_index: usize,

        /// Why the handle was rejected.
        problem: HandleProblem,
    },

    /// Adding a reference would exceed the maximum reference count of a slot.
    #[error(
        "reference count of slot {slot_index} in pool {pool_id} cannot exceed {max_references}"
    )]
    RefCountOverflow {
        /// The pool owning the slot.
        pool_id: PoolId,

        /// The slot whose reference count is saturated.
        slot_index: usize,

        /// The configured reference count ceiling.
        max_references: u32,
    },

    /// A size or capacity parameter is outside what the pool can represent.
    #[error("capacity error in pool {pool_id}: {problem}")]
    CapacityError {
        /// The pool that rejected the request.
        pool_id: PoolId,

        /// The slot involved, if the problem concerns an existing allocation.
        slot_index: Option<usize>,

        /// A human-readable description of the problem.
        problem: &'static str,
    },

    /// A required input was empty or missing.
    #[error("missing input in pool {pool_id}: {problem}")]
    NullInput {
        /// The pool that rejected the request.
        pool_id: PoolId,

        /// The slot involved, if the problem concerns an existing allocation.
        slot_index: Option<usize>,

        /// A human-readable description of what was missing.
        problem: &'static str,
    },
}

/// Classification of an [`Error`], used in [`Failure`] descriptors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::PoolExhausted`].
    PoolExhausted,

    /// See [`Error::InvalidHandle`].
    InvalidHandle,

    /// See [`Error::RefCountOverflow`].
    RefCountOverflow,

    /// See [`Error::CapacityError`].
    CapacityError,

    /// See [`Error::NullInput`].
    NullInput,
}

impl ErrorKind {
    /// Whether this kind indicates a bug in the caller's use of handles, as opposed to
    /// resource exhaustion or a configuration problem.
    #[must_use]
    pub fn is_protocol_violation(self) -> bool {
        matches!(self, Self::InvalidHandle | Self::RefCountOverflow)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PoolExhausted => "pool exhausted",
            Self::InvalidHandle => "invalid handle",
            Self::RefCountOverflow => "reference count overflow",
            Self::CapacityError => "capacity error",
            Self::NullInput => "null input",
        };

        f.write_str(name)
    }
}

/// The reason a handle was rejected with [`Error::InvalidHandle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HandleProblem {
    /// The handle was issued by a different pool.
    ForeignPool {
        /// The pool that issued the handle.
        issued_by: PoolId,
    },

    /// The slot index is not within the capacity of the pool.
    OutOfBounds,

    /// The slot is not allocated. Typically a double release.
    SlotFree,

    /// The slot was released and allocated again since the handle was issued.
    Stale,
}

impl fmt::Display for HandleProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignPool { issued_by } => write!(f, "handle was issued by pool {issued_by}"),
            Self::OutOfBounds => f.write_str("slot index is out of bounds"),
            Self::SlotFree => f.write_str("slot is not allocated"),
            Self::Stale => f.write_str("slot has been reused since the handle was issued"),
        }
    }
}

impl Error {
    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            Self::RefCountOverflow { .. } => ErrorKind::RefCountOverflow,
            Self::CapacityError { .. } => ErrorKind::CapacityError,
            Self::NullInput { .. } => ErrorKind::NullInput,
        }
    }

    /// Returns the pool that raised this error.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        match self {
            Self::PoolExhausted { pool_id, .. }
            | Self::InvalidHandle { pool_id, .. }
            | Self::RefCountOverflow { pool_id, .. }
            | Self::CapacityError { pool_id, .. }
            | Self::NullInput { pool_id, .. } => *pool_id,
        }
    }

    /// Returns the slot involved in this error, if any.
    #[must_use]
    pub fn slot_index(&self) -> Option<usize> {
        match self {
            Self::PoolExhausted { .. } => None,
            Self::InvalidHandle { slot_index, .. } | Self::RefCountOverflow { slot_index, .. } => {
                Some(*slot_index)
            }
            Self::CapacityError { slot_index, .. } | Self::NullInput { slot_index, .. } => {
                *slot_index
            }
        }
    }

    /// Returns the structured failure descriptor handed to failure policies.
    #[must_use]
    pub fn failure(&self) -> Failure {
        Failure::new(self.kind(), self.pool_id(), self.slot_index())
    }
}

/// A specialized `Result` type for allocator operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
