//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling. Variants distinguish per-message failures (reported and skipped
//! in batch mode) from store-level failures (which abort the operation).

use thiserror::Error;

/// Application error type
///
/// Covers all error cases the classifier engine may encounter.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Unparseable message; local to a single input
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// Store cannot be opened or written; fatal to the caller
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Store integrity check failed; recovery path is export/import
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),
    /// Lock acquisition timed out; the caller may retry
    #[error("store busy: {0}")]
    StoreBusy(String),
    /// Attempted to remove a message whose digest is not recorded
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    /// Configuration value out of range or unrecognized; fatal at startup
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// I/O failure outside the store (message files, dumps, backups)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Convenience constructor for `MalformedMessage`
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Convenience constructor for `ConfigInvalid`
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Whether this error is scoped to a single input message
    ///
    /// Batch operations count these and continue; anything else aborts the
    /// batch.
    pub fn is_per_message(&self) -> bool {
        matches!(self, Self::MalformedMessage(_) | Self::UnknownMessage(_))
    }

    /// Whether retrying the operation may succeed without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreBusy(_))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type ProbeResult<T> = Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::ProbeError;

    #[test]
    fn per_message_errors_are_skippable_in_batch() {
        assert!(ProbeError::malformed("no headers").is_per_message());
        assert!(ProbeError::UnknownMessage("digest absent".to_owned()).is_per_message());
        assert!(!ProbeError::StoreUnavailable("gone".to_owned()).is_per_message());
    }

    #[test]
    fn only_busy_is_retryable() {
        assert!(ProbeError::StoreBusy("lock timeout".to_owned()).is_retryable());
        assert!(!ProbeError::StoreCorrupt("bad magic".to_owned()).is_retryable());
    }
}
