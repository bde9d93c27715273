//! Journal error types.
//!
//! This module defines all error types for the journal.

use std::io;
use thiserror::Error;

use crate::journal::JournalState;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error from the underlying file abstraction.
    #[error("journal I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Invalid configuration.
    #[error("journal configuration error: {reason}")]
    ConfigError { reason: String },

    /// Operation requires a different journal state.
    #[error("journal must be in state {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: JournalState,
    },

    /// Update or delete of an id the journal does not know.
    #[error("cannot find add info for record {id}")]
    RecordNotFound { id: u64 },

    /// Commit or rollback of an unknown transaction.
    #[error("cannot find transaction {tx_id}")]
    TransactionNotFound { tx_id: u64 },

    /// Record cannot fit into an empty journal file.
    #[error("record is too large to store: {size} bytes exceeds maximum {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// File header carries a format version this build cannot read.
    #[error("journal file {file} has incompatible format version {found}")]
    IncompatibleVersion { file: String, found: u32 },

    /// File header carries a different user version.
    #[error("journal file {file} has user version {found}, expected {expected}")]
    UserVersionMismatch {
        file: String,
        expected: u32,
        found: u32,
    },

    /// A file could not be read in full.
    #[error("short read on {file}: expected {expected} bytes, read {read}")]
    ShortRead {
        file: String,
        expected: usize,
        read: usize,
    },

    /// The scanner's own bookkeeping disagreed with a record it accepted.
    #[error("internal error loading {file} at position {position}: {reason}")]
    InternalCorruption {
        file: String,
        position: usize,
        reason: String,
    },

    /// A compaction is already running.
    #[error("there is a pending compacting operation")]
    CompactionInProgress,

    /// Compaction failed.
    #[error("compaction failed: {reason}")]
    CompactionFailed { reason: String },

    /// A blocking wait exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// A background executor no longer accepts work.
    #[error("executor {name} is shut down")]
    ExecutorClosed { name: String },

    /// An asynchronous write reported failure through its completion.
    #[error("I/O completion failed with code {code}: {message}")]
    CompletionFailed { code: i32, message: String },

    /// Internal inconsistency in the journal's bookkeeping.
    #[error("journal inconsistency: {reason}")]
    Inconsistency { reason: String },
}

impl JournalError {
    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(expected: &'static str, actual: JournalState) -> Self {
        Self::InvalidState { expected, actual }
    }

    /// Creates a record too large error.
    pub fn record_too_large(size: usize, max: usize) -> Self {
        Self::RecordTooLarge { size, max }
    }

    /// Creates an internal corruption error.
    pub fn internal_corruption(
        file: impl Into<String>,
        position: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::InternalCorruption {
            file: file.into(),
            position,
            reason: reason.into(),
        }
    }

    /// Creates a compaction failure.
    pub fn compaction_failed(reason: impl Into<String>) -> Self {
        Self::CompactionFailed {
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Creates an inconsistency error.
    pub fn inconsistency(reason: impl Into<String>) -> Self {
        Self::Inconsistency {
            reason: reason.into(),
        }
    }

    /// Returns true if the error is fatal to the calling operation only.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::RecordNotFound { .. }
                | Self::TransactionNotFound { .. }
                | Self::CompactionInProgress
        )
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InternalCorruption { .. }
                | Self::IncompatibleVersion { .. }
                | Self::ShortRead { .. }
                | Self::Inconsistency { .. }
        )
    }

    /// Returns true if this is a configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError { .. } | Self::RecordTooLarge { .. })
    }

    /// Returns true if a blocking wait gave up.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_classification() {
        let err = JournalError::invalid_state("LOADED", JournalState::Stopped);
        assert!(err.is_state_error());
        assert!(!err.is_corruption());

        let err = JournalError::internal_corruption("a.njr", 16, "check size");
        assert!(err.is_corruption());
        assert!(!err.is_state_error());

        let err = JournalError::record_too_large(2048, 1008);
        assert!(err.is_config_error());

        let err = JournalError::timeout("compaction", Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(matches!(err, JournalError::Timeout { timeout_ms: 2000, .. }));
    }

    #[test]
    fn test_error_display() {
        let err = JournalError::invalid_state("LOADED", JournalState::Started);
        let msg = format!("{}", err);
        assert!(msg.contains("LOADED"));
        assert!(msg.contains("STARTED"));

        let err = JournalError::TransactionNotFound { tx_id: 77 };
        assert!(err.to_string().contains("77"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: JournalError = io_err.into();
        assert!(matches!(err, JournalError::Io { .. }));
    }
}
