//! Error types for the native index.

use thiserror::Error;

/// Result type alias using IndexError.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur while populating or reading an index.
#[derive(Debug, Error)]
pub enum IndexError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Population errors
    #[error("Index entry conflict: entity {existing} and entity {added} both have value {value}")]
    Conflict {
        existing: i64,
        added: i64,
        value: String,
    },

    #[error("Index entry too large: {size} bytes (max {max})")]
    OversizedEntry { size: usize, max: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Population cancelled")]
    Cancelled,

    #[error("Buffer arena exhausted: requested {requested} bytes with {used} of {limit} in use")]
    ArenaExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    // Format errors
    #[error(
        "Incompatible index format {found_major}.{found_minor}, expected {expected_major}.{expected_minor}"
    )]
    IncompatibleVersion {
        found_major: i32,
        found_minor: i32,
        expected_major: i32,
        expected_minor: i32,
    },

    #[error("Index corrupted: {0}")]
    Corrupted(String),

    // Type errors
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse fault taxonomy surfaced to callers of the populator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Two entities share a value in a unique index.
    Conflict,
    /// An entry exceeds the per-entry size cap.
    OversizedEntry,
    /// An operation was called in the wrong lifecycle state.
    InvalidState,
    /// Underlying storage failed.
    Io,
    /// Anything else.
    Other,
}

impl IndexError {
    /// Maps this error onto the fault taxonomy.
    pub fn kind(&self) -> FaultKind {
        match self {
            IndexError::Conflict { .. } => FaultKind::Conflict,
            IndexError::OversizedEntry { .. } => FaultKind::OversizedEntry,
            IndexError::InvalidState(_) => FaultKind::InvalidState,
            IndexError::Io(_) | IndexError::Corrupted(_) => FaultKind::Io,
            _ => FaultKind::Other,
        }
    }

    /// Shorthand for an InvalidState error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        IndexError::InvalidState(msg.into())
    }
}

/// Runs every action and returns the first error encountered.
///
/// Later errors are reported through `on_suppressed` so they are not lost.
pub fn run_all<I, F>(actions: I, mut on_suppressed: F) -> Result<()>
where
    I: IntoIterator,
    I::Item: FnOnce() -> Result<()>,
    F: FnMut(&IndexError),
{
    let mut first: Option<IndexError> = None;
    for action in actions {
        if let Err(e) = action() {
            if first.is_none() {
                first = Some(e);
            } else {
                on_suppressed(&e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: IndexError = io_err.into();
        assert!(matches!(err, IndexError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
        assert_eq!(err.kind(), FaultKind::Io);
    }

    #[test]
    fn test_conflict_display() {
        let err = IndexError::Conflict {
            existing: 1,
            added: 2,
            value: "\"alice\"".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Index entry conflict: entity 1 and entity 2 both have value \"alice\""
        );
        assert_eq!(err.kind(), FaultKind::Conflict);
    }

    #[test]
    fn test_oversized_display() {
        let err = IndexError::OversizedEntry {
            size: 4097,
            max: 4096,
        };
        assert_eq!(
            err.to_string(),
            "Index entry too large: 4097 bytes (max 4096)"
        );
        assert_eq!(err.kind(), FaultKind::OversizedEntry);
    }

    #[test]
    fn test_arena_exhausted_display() {
        let err = IndexError::ArenaExhausted {
            requested: 100,
            used: 950,
            limit: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Buffer arena exhausted: requested 100 bytes with 950 of 1000 in use"
        );
    }

    #[test]
    fn test_incompatible_version_display() {
        let err = IndexError::IncompatibleVersion {
            found_major: 2,
            found_minor: 0,
            expected_major: 1,
            expected_minor: 3,
        };
        assert_eq!(
            err.to_string(),
            "Incompatible index format 2.0, expected 1.3"
        );
    }

    #[test]
    fn test_invalid_state_kind() {
        let err = IndexError::invalid_state("closed");
        assert_eq!(err.to_string(), "Invalid state: closed");
        assert_eq!(err.kind(), FaultKind::InvalidState);
        assert_eq!(IndexError::Cancelled.kind(), FaultKind::Other);
    }

    #[test]
    fn test_run_all_returns_first_error() {
        let mut suppressed = 0;
        let actions: Vec<Box<dyn FnOnce() -> Result<()>>> = vec![
            Box::new(|| Ok(())),
            Box::new(|| Err(IndexError::Internal("first".to_string()))),
            Box::new(|| Err(IndexError::Internal("second".to_string()))),
        ];
        let result = run_all(actions, |_| suppressed += 1);
        match result {
            Err(IndexError::Internal(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(suppressed, 1);
    }

    #[test]
    fn test_run_all_runs_everything() {
        let counter = std::cell::Cell::new(0);
        let actions: Vec<Box<dyn FnOnce() -> Result<()>>> = vec![
            Box::new(|| {
                counter.set(counter.get() + 1);
                Err(IndexError::Cancelled)
            }),
            Box::new(|| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        ];
        assert!(run_all(actions, |_| {}).is_err());
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(IndexError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<IndexError>();
    }
}
