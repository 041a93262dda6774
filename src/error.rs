//! Error types reported by the registry.
//!
//! The registry recovers locally from its own contention (lost CAS,
//! do-not-disturb yields, table churn) and never surfaces it. What reaches
//! the caller is invalid input, missing handles or classes, and failures of
//! user callbacks, which are carried verbatim.

use thiserror::Error;

use crate::handle::{ClassId, Hid};

/// Result alias used throughout the crate.
pub type Result<T, E = IdError> = core::result::Result<T, E>;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum IdError {
    /// The handle is malformed or reserved.
    #[error("malformed handle {:#x}", .0.0)]
    BadId(Hid),

    /// The handle belongs to a different class than the caller expected.
    #[error("handle {id} belongs to {actual}, expected {expected}")]
    BadClass {
        /// The handle that was presented.
        id: Hid,
        /// The class the caller asked for.
        expected: ClassId,
        /// The class encoded in the handle.
        actual: ClassId,
    },

    /// The class index lies outside `1..MAX_CLASSES`.
    #[error("class index {0} out of range")]
    BadRange(u32),

    /// A required argument was missing or invalid.
    #[error("invalid argument: {0}")]
    BadArg(&'static str),

    /// No class is currently published at this index.
    #[error("no such class: {0}")]
    NoSuchClass(ClassId),

    /// The handle is not registered, or has been deleted.
    #[error("no such handle: {0}")]
    NoSuchId(Hid),

    /// Every class slot is taken.
    #[error("all class slots are in use")]
    NoSpace,

    /// The allocator could not provide memory.
    #[error("out of memory")]
    NoMem,

    /// A user-supplied callback reported failure.
    #[error("callback failed: {0}")]
    CallbackFailed(#[source] anyhow::Error),

    /// The member count could not be taken because the class went away.
    #[error("cannot count members of {0}")]
    CantCount(ClassId),
}

/// Field-less mirror of [`IdError`], for callers that only match on kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`IdError::BadId`].
    BadId,
    /// See [`IdError::BadClass`].
    BadClass,
    /// See [`IdError::BadRange`].
    BadRange,
    /// See [`IdError::BadArg`].
    BadArg,
    /// See [`IdError::NoSuchClass`].
    NoSuchClass,
    /// See [`IdError::NoSuchId`].
    NoSuchId,
    /// See [`IdError::NoSpace`].
    NoSpace,
    /// See [`IdError::NoMem`].
    NoMem,
    /// See [`IdError::CallbackFailed`].
    CallbackFail,
    /// See [`IdError::CantCount`].
    CantCount,
}

impl IdError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdError::BadId(_) => ErrorKind::BadId,
            IdError::BadClass { .. } => ErrorKind::BadClass,
            IdError::BadRange(_) => ErrorKind::BadRange,
            IdError::BadArg(_) => ErrorKind::BadArg,
            IdError::NoSuchClass(_) => ErrorKind::NoSuchClass,
            IdError::NoSuchId(_) => ErrorKind::NoSuchId,
            IdError::NoSpace => ErrorKind::NoSpace,
            IdError::NoMem => ErrorKind::NoMem,
            IdError::CallbackFailed(_) => ErrorKind::CallbackFail,
            IdError::CantCount(_) => ErrorKind::CantCount,
        }
    }

    pub(crate) fn callback(err: anyhow::Error) -> Self {
        tracing::warn!(error = %err, "registry callback failed");
        IdError::CallbackFailed(err)
    }
}
