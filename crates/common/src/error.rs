use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SQLSTATE-style classification codes attached to every [`RowflowError`].
///
/// The session layer maps these onto client-visible error codes; this crate
/// only needs them to decide retryability and whether an error was already
/// categorized before it crossed a panic boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// `08006`
    ConnectionFailure,
    /// `57014`
    QueryCanceled,
    /// `53200`
    OutOfMemory,
    /// `XX000`
    Internal,
    /// `22000`
    DataException,
    /// `42000`
    SyntaxOrAccessRule,
    /// `0A000`
    FeatureNotSupported,
    /// `22023`
    InvalidParameterValue,
    /// `XXUUU`
    Uncategorized,
}

impl ErrorCode {
    /// Five-character SQLSTATE string for this code.
    pub fn sqlstate(self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailure => "08006",
            ErrorCode::QueryCanceled => "57014",
            ErrorCode::OutOfMemory => "53200",
            ErrorCode::Internal => "XX000",
            ErrorCode::DataException => "22000",
            ErrorCode::SyntaxOrAccessRule => "42000",
            ErrorCode::FeatureNotSupported => "0A000",
            ErrorCode::InvalidParameterValue => "22023",
            ErrorCode::Uncategorized => "XXUUU",
        }
    }
}

/// Canonical rowflow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RowflowError::Connection`]: flow/stream rendezvous failures (not found,
///   came too late, registry draining, closed transport); retryable
/// - [`RowflowError::Execution`]: expression evaluation, decode or row-shape
///   failures surfaced as metadata; not retried here
/// - [`RowflowError::QueryCanceled`]: the flow was canceled; retryable by the caller
/// - [`RowflowError::Internal`]: assertion failures and captured vectorized panics
/// - [`RowflowError::ResourceExhausted`]: byte budget exceeded; fatal to the operator
///
/// Errors travel inside producer metadata and across the wire, so the enum is
/// cloneable and serializable.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RowflowError {
    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Flow or processor setup failures (bad specs, mismatched orderings).
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime failures after setup succeeded.
    ///
    /// Examples:
    /// - expression evaluation/type mismatch
    /// - row/batch decode failures
    #[error("execution error: {0}")]
    Execution(String),

    /// The query (and therefore its flow) was canceled.
    #[error("query execution canceled")]
    QueryCanceled,

    /// Stream connection and registry rendezvous failures.
    #[error("{0}")]
    Connection(String),

    /// A memory reservation exceeded its configured budget.
    #[error("{monitor}: memory budget exceeded: {requested} bytes requested, {used} currently allocated, {budget} bytes in budget")]
    ResourceExhausted {
        /// Monitor name.
        monitor: String,
        /// Bytes requested by the failing reservation.
        requested: usize,
        /// Bytes held before the request.
        used: usize,
        /// Configured ceiling.
        budget: usize,
    },

    /// Unexpected internal faults.
    #[error("internal error: {0}")]
    Internal(String),

    /// Valid request for a feature that is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Error of unknown classification, typically raised by code outside this
    /// subsystem.
    #[error("{0}")]
    Uncategorized(String),
}

impl RowflowError {
    /// Classification code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RowflowError::InvalidConfig(_) => ErrorCode::InvalidParameterValue,
            RowflowError::Planning(_) => ErrorCode::SyntaxOrAccessRule,
            RowflowError::Execution(_) => ErrorCode::DataException,
            RowflowError::QueryCanceled => ErrorCode::QueryCanceled,
            RowflowError::Connection(_) => ErrorCode::ConnectionFailure,
            RowflowError::ResourceExhausted { .. } => ErrorCode::OutOfMemory,
            RowflowError::Internal(_) => ErrorCode::Internal,
            RowflowError::Unsupported(_) => ErrorCode::FeatureNotSupported,
            RowflowError::Uncategorized(_) => ErrorCode::Uncategorized,
        }
    }

    /// Whether a client may transparently retry the statement that hit this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RowflowError::Connection(_) | RowflowError::QueryCanceled
        )
    }

    /// Annotate an uncategorized error as an unexpected internal fault.
    ///
    /// Errors that already carry a classification are returned unchanged.
    pub fn wrap_unexpected(self, context: &str) -> RowflowError {
        match self {
            RowflowError::Uncategorized(msg) => RowflowError::Internal(format!("{context}: {msg}")),
            other => other,
        }
    }
}

/// Standard rowflow result alias.
pub type Result<T> = std::result::Result<T, RowflowError>;
