//! Error taxonomy shared by every runtime operation.
//!
//! Each fallible call is checked at its call site and the first failure aborts
//! the build or execution in progress. Nothing here retries; the caller (or a
//! bridging layer above it) decides whether to rebuild with a different
//! configuration.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, DnnError>;

/// Everything that can go wrong while building or running a net.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnnError {
    /// Malformed dimensions (no dimensions, negative extents, wrong rank for a format).
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// The backend cannot realize the requested operation, layout or data type.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Related descriptors disagree on their dimensions.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A primitive was wired with the wrong number (or kind) of bindings.
    #[error("arity mismatch: expected {expected} {what}, got {got}")]
    ArityMismatch {
        /// Which binding list was wrong.
        what: &'static str,
        /// Number of bindings the descriptor requires.
        expected: usize,
        /// Number of bindings supplied.
        got: usize,
    },

    /// An allocation failed.
    #[error("resource exhaustion: could not allocate {bytes} bytes")]
    ResourceExhaustion {
        /// Size of the failed request.
        bytes: usize,
    },

    /// A primitive failed while its net was executing.
    #[error("primitive #{index} failed during execution: {reason}")]
    BackendExecutionFailure {
        /// Position of the failing primitive inside the submitted net.
        index: usize,
        /// Backend-provided description.
        reason: String,
    },

    /// A handle was used after it (or a resource it depends on) was destroyed.
    #[error("use after free: {0} handle is stale or was destroyed")]
    UseAfterFree(&'static str),

    /// An operation was issued in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Flat status codes handed to a bridging layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// The operation completed.
    Success = 0,
    /// See [`DnnError::InvalidShape`].
    InvalidShape = 1,
    /// See [`DnnError::UnsupportedConfiguration`].
    UnsupportedConfiguration = 2,
    /// See [`DnnError::ShapeMismatch`].
    ShapeMismatch = 3,
    /// See [`DnnError::ArityMismatch`].
    ArityMismatch = 4,
    /// See [`DnnError::ResourceExhaustion`].
    ResourceExhaustion = 5,
    /// See [`DnnError::BackendExecutionFailure`].
    BackendExecutionFailure = 6,
    /// See [`DnnError::UseAfterFree`].
    UseAfterFree = 7,
    /// See [`DnnError::InvalidState`].
    InvalidState = 8,
}

impl Status {
    /// Stable integer code, `0` meaning success.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Collapses a result into its status.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => err.status(),
        }
    }
}

impl DnnError {
    /// The status code matching this error.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidShape(_) => Status::InvalidShape,
            Self::UnsupportedConfiguration(_) => Status::UnsupportedConfiguration,
            Self::ShapeMismatch(_) => Status::ShapeMismatch,
            Self::ArityMismatch { .. } => Status::ArityMismatch,
            Self::ResourceExhaustion { .. } => Status::ResourceExhaustion,
            Self::BackendExecutionFailure { .. } => Status::BackendExecutionFailure,
            Self::UseAfterFree(_) => Status::UseAfterFree,
            Self::InvalidState(_) => Status::InvalidState,
        }
    }

    pub(crate) fn invalid_shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(msg.into())
    }

    pub(crate) fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub(crate) fn execution(index: usize, reason: impl Into<String>) -> Self {
        Self::BackendExecutionFailure {
            index,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_distinct_and_success_is_zero() {
        let errors = [
            DnnError::invalid_shape("x"),
            DnnError::unsupported("x"),
            DnnError::shape_mismatch("x"),
            DnnError::ArityMismatch { what: "inputs", expected: 2, got: 1 },
            DnnError::ResourceExhaustion { bytes: 4 },
            DnnError::execution(0, "x"),
            DnnError::UseAfterFree("engine"),
            DnnError::InvalidState("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.status().code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&Status::Success.code()));
        assert_eq!(Status::of(&Ok::<(), DnnError>(())), Status::Success);
    }

    #[test]
    fn arity_message_names_the_binding_list() {
        let err = DnnError::ArityMismatch { what: "inputs", expected: 3, got: 1 };
        assert_eq!(err.to_string(), "arity mismatch: expected 3 inputs, got 1");
    }
}
