use thiserror::Error;

use crate::types::{StreamType, TupleAddress};

/// Convenience alias for `Result<T, StorageError>`.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error classification for recovery decisions.
///
/// - `UserError`   — bad input or rejected operation; local to the call, no
///   side effects, the partition stays fully usable.
/// - `InternalBug` — an engine invariant was violated; triggers alert +
///   diagnostic dump, and aborts any in-flight stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    InternalBug,
}

/// Storage and streaming layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Tuple not found at {0}")]
    TupleNotFound(TupleAddress),

    #[error("Stream already active: {0}")]
    StreamAlreadyActive(StreamType),

    #[error("Stream type not supported: {0}")]
    UnsupportedStreamType(StreamType),

    #[error("Predicate parse error: {0}")]
    PredicateParse(String),

    #[error("Output stream count mismatch: expected {expected}, got {got}")]
    OutputStreamCountMismatch { expected: usize, got: usize },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Invariant violation — should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalCorruption [{error_code}]: {message} | context: {debug_context}")]
    InternalCorruption {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

impl StorageError {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::ConstraintViolation(_)
            | StorageError::TupleNotFound(_)
            | StorageError::StreamAlreadyActive(_)
            | StorageError::UnsupportedStreamType(_)
            | StorageError::PredicateParse(_)
            | StorageError::OutputStreamCountMismatch { .. } => ErrorKind::UserError,
            StorageError::SchemaMismatch(_) | StorageError::InternalCorruption { .. } => {
                ErrorKind::InternalBug
            }
        }
    }

    /// Returns true if this is a user/input error, recovered and returned to
    /// the caller with no side effects.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if this is an internal bug that should never occur.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Construct an internal corruption error with error code and context.
    pub fn internal_corruption(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        StorageError::InternalCorruption {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Emit a structured log entry for InternalBug errors.
    /// Must be called before a fatal error is surfaced to the caller.
    pub fn log_if_fatal(&self) {
        if let StorageError::InternalCorruption {
            error_code,
            message,
            debug_context,
        } = self
        {
            tracing::error!(
                error_code = error_code,
                error_category = "Fatal",
                debug_context = debug_context.as_str(),
                "FATAL [{}]: {}",
                error_code,
                message
            );
        }
    }
}

/// Report an invariant violation: aborts the process in debug builds, returns
/// an `InternalCorruption` value in release builds.
/// Usage: `return Err(corruption!("E-COW-001", "dirty slot after snapshot end at {}", addr))`
#[macro_export]
macro_rules! corruption {
    ($code:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        debug_assert!(false, "[{}] {}", $code, message);
        let err = $crate::error::StorageError::internal_corruption($code, message, String::new());
        err.log_if_fatal();
        err
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockId, StreamType};

    #[test]
    fn test_constraint_violation_is_user_error() {
        let e = StorageError::ConstraintViolation("duplicate key 42".into());
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.is_user_error());
        assert!(!e.is_internal_bug());
    }

    #[test]
    fn test_already_active_is_user_error() {
        let e = StorageError::StreamAlreadyActive(StreamType::Snapshot);
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.to_string().contains("snapshot"));
    }

    #[test]
    fn test_predicate_parse_is_user_error() {
        let e = StorageError::PredicateParse("missing TYPE".into());
        assert_eq!(e.kind(), ErrorKind::UserError);
    }

    #[test]
    fn test_corruption_is_internal_bug() {
        let e = StorageError::internal_corruption("E-IDX-001", "stale index entry", "block=3");
        assert_eq!(e.kind(), ErrorKind::InternalBug);
        assert!(e.is_internal_bug());
        assert!(e.to_string().contains("E-IDX-001"));
        assert!(e.to_string().contains("block=3"));
    }

    #[test]
    fn test_schema_mismatch_is_internal_bug() {
        let e = StorageError::SchemaMismatch("tuple width 65 != block layout 64".into());
        assert_eq!(e.kind(), ErrorKind::InternalBug);
    }

    #[test]
    fn test_tuple_not_found_display() {
        let addr = crate::types::TupleAddress::new(BlockId(5), 17);
        let e = StorageError::TupleNotFound(addr);
        assert!(e.to_string().contains("block:5/17"));
    }
}
