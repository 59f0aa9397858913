use std::sync::PoisonError;

use thiserror::Error;

/// Failure taxonomy shared by every backend.
///
/// Variants are cheap to clone so a cached compilation failure can be handed
/// to every caller that asked for the same fingerprint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HalError {
    /// A backend dependency is missing (driver library not installed, device not present).
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Caller misuse: stale descriptor, out-of-range ordinal, foreign handle.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation not permitted in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The executable blob is malformed or unsupported for the target backend.
    #[error("compilation failure: {0}")]
    CompilationFailure(String),
    /// The backend could not reserve memory or queue slots.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Hardware or driver failure; the device must be recreated.
    #[error("device lost: {0}")]
    DeviceLost(String),
    /// A wait timed out; the awaited work may still complete later.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// A module referenced an import that is not registered with a matching signature.
    #[error("unresolved import '{name}': {detail}")]
    UnresolvedImport { name: String, detail: String },
    /// Work was abandoned before it could complete.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// An operation aborted for a backend-specific reason.
    #[error("execution failure: {0}")]
    Execution(String),
}

impl HalError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        HalError::Unavailable(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        HalError::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        HalError::InvalidState(message.into())
    }

    pub fn compilation(message: impl Into<String>) -> Self {
        HalError::CompilationFailure(message.into())
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        HalError::ResourceExhausted(message.into())
    }

    pub fn device_lost(message: impl Into<String>) -> Self {
        HalError::DeviceLost(message.into())
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        HalError::DeadlineExceeded(message.into())
    }

    pub fn unresolved_import(name: impl Into<String>, detail: impl Into<String>) -> Self {
        HalError::UnresolvedImport {
            name: name.into(),
            detail: detail.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        HalError::Cancelled(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        HalError::Execution(message.into())
    }

    /// Short stable name of the variant, used in logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            HalError::Unavailable(_) => "unavailable",
            HalError::InvalidArgument(_) => "invalid_argument",
            HalError::InvalidState(_) => "invalid_state",
            HalError::CompilationFailure(_) => "compilation_failure",
            HalError::ResourceExhausted(_) => "resource_exhausted",
            HalError::DeviceLost(_) => "device_lost",
            HalError::DeadlineExceeded(_) => "deadline_exceeded",
            HalError::UnresolvedImport { .. } => "unresolved_import",
            HalError::Cancelled(_) => "cancelled",
            HalError::Execution(_) => "execution",
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, HalError::DeviceLost(_))
    }
}

impl<T> From<PoisonError<T>> for HalError {
    fn from(_: PoisonError<T>) -> Self {
        HalError::execution("internal lock poisoned")
    }
}

/// Convenience alias for results returned by HAL routines.
pub type HalResult<T> = Result<T, HalError>;
