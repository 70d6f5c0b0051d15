use thiserror::Error;

/// Canonical FMQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FmqError::Cancelled`]: the caller's cancellation token fired; never retried internally
/// - [`FmqError::Storage`]: series enumeration or sample loading failures from the storage backend
/// - [`FmqError::Iterator`]: a per-series sample iterator failed mid-scan
/// - [`FmqError::RemoteUnavailable`]: a remote engine could not be reached or closed the stream early
/// - [`FmqError::RemoteEvaluation`]: a remote engine was reached but reported a query evaluation failure
/// - [`FmqError::Planning`]: query shape/name issues discovered before execution
/// - [`FmqError::InvalidConfig`]: engine option contract violations
///
/// The enum is `Clone` so that a memoized initialization error (for example a
/// failed series enumeration shared across operators) can be observed by every
/// waiter, not only the caller that ran the initializer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FmqError {
    /// Evaluation was cancelled through the caller's cancellation token.
    #[error("query evaluation cancelled")]
    Cancelled,

    /// Storage backend failure while enumerating series or loading samples.
    #[error("storage error: {0}")]
    Storage(String),

    /// A per-series sample iterator reported a failure mid-scan.
    #[error("iterator error: {0}")]
    Iterator(String),

    /// A remote engine was unreachable or terminated its result stream early.
    #[error("remote engine unavailable: {0}")]
    RemoteUnavailable(String),

    /// A remote engine evaluated the query and reported a failure.
    #[error("remote evaluation error: {0}")]
    RemoteEvaluation(String),

    /// Query planning failures.
    ///
    /// Examples:
    /// - unknown range function name
    /// - unsupported aggregation operator in a parsed expression
    #[error("planning error: {0}")]
    Planning(String),

    /// Invalid or inconsistent engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Standard FMQ result alias.
pub type Result<T> = std::result::Result<T, FmqError>;
