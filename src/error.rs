use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Unknown plan, plan version, metric or price. Retrying cannot fix it.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Usage outside the slack window or targeting a sealed slot.
    #[error("Stale usage: {0}")]
    Stale(String),

    /// Lost a compare-and-swap race on a snapshot.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Transient storage failure.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Usage rejected by validation before reaching the formulas.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Structural storage failure (corrupt log, serialization).
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Wire-level classification of an [`Error`], reported back to submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Stale,
    Conflict,
    StorageUnavailable,
    MalformedInput,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Stale(_) => ErrorKind::Stale,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Error::MalformedInput(_) => ErrorKind::MalformedInput,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only transient write failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::StorageUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::Conflict("org".to_string()).is_retryable());
        assert!(Error::StorageUnavailable("disk".to_string()).is_retryable());
        assert!(!Error::NotFound("plan".to_string()).is_retryable());
        assert!(!Error::Stale("late".to_string()).is_retryable());
        assert!(!Error::MalformedInput("measure".to_string()).is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&Error::NotFound("x".to_string()).kind()).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
