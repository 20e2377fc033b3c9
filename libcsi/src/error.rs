//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.
//!
//! Callers that need the protocol status of a failure (to decide whether to
//! retry, back off, or surface it to an operator) use [`CsiError::code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied a malformed or incomplete request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required prior step was skipped by the caller, e.g. the staging
    /// target was not pre-created or the volume is not staged yet.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The disk, path, or record does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflicting mount already exists with different options.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The path resolved to something other than a device node.
    #[error("{0} is not a block device")]
    NotBlockDevice(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An optimistic-concurrency check failed: the stored record changed
    /// between read and write.  The caller owns the retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Host state is inconsistent or an OS command failed.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Protocol status codes a [`CsiError`] maps onto.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    AlreadyExists,
    Aborted,
    Unavailable,
    Internal,
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The protocol status this error is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Conflict(_) => ErrorCode::Aborted,
            Self::TransportError(_) => ErrorCode::Unavailable,
            Self::NotBlockDevice(_)
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}
