use std::fmt;

/// Machine-readable error codes surfaced on acks, run reports, and CLI errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownCategory,
    MalformedPayload,
    StorageUnavailable,
    ConstraintViolation,
    StorageFailure,
    ConfigurationError,
    LockContention,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::UnknownCategory => "E1001",
            Self::MalformedPayload => "E1002",
            Self::StorageUnavailable => "E2001",
            Self::ConstraintViolation => "E2002",
            Self::StorageFailure => "E2003",
            Self::ConfigurationError => "E3001",
            Self::LockContention => "E4001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::UnknownCategory => "Unknown event category",
            Self::MalformedPayload => "Malformed event payload",
            Self::StorageUnavailable => "Storage temporarily unavailable",
            Self::ConstraintViolation => "Storage constraint violated",
            Self::StorageFailure => "Storage failure",
            Self::ConfigurationError => "Configuration error",
            Self::LockContention => "Rollup lock contention",
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::UnknownCategory => Some("Run `tally categories` to list registered categories."),
            Self::MalformedPayload => None,
            Self::StorageUnavailable => Some("Retry the whole operation once the database is free."),
            Self::ConstraintViolation => {
                Some("Inspect the rollup tables; the category is skipped until fixed.")
            }
            Self::StorageFailure => Some("Run `tally init` to create or repair the schema."),
            Self::ConfigurationError => Some("Fix the category registry or tally.toml and restart."),
            Self::LockContention => Some("Another rollup run holds the lock; wait for it to finish."),
        }
    }

    /// Whether the failed operation may succeed if retried unchanged.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::StorageUnavailable | Self::LockContention)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl serde::Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// Errors produced by the recorder, the aggregator, and the registry.
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    /// The category (or intake `endpoint`) is not in the registry.
    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    /// Required payload fields are missing or have the wrong shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Busy, locked, or unopenable database.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] rusqlite::Error),

    /// An insert or upsert tripped a table constraint.
    #[error("constraint violation: {0}")]
    ConstraintViolation(#[source] rusqlite::Error),

    /// Any other storage error.
    #[error("storage error: {0}")]
    Storage(#[source] rusqlite::Error),

    /// Registry entry, schema, or run parameters are invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),
}

impl TallyError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownCategory(_) => ErrorCode::UnknownCategory,
            Self::MalformedPayload(_) => ErrorCode::MalformedPayload,
            Self::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            Self::ConstraintViolation(_) => ErrorCode::ConstraintViolation,
            Self::Storage(_) => ErrorCode::StorageFailure,
            Self::Configuration(_) => ErrorCode::ConfigurationError,
            Self::Lock(err) => err.code(),
        }
    }

    /// Remediation hint, falling back to the code's generic message.
    #[must_use]
    pub fn suggestion(&self) -> String {
        self.code()
            .hint()
            .unwrap_or_else(|| self.code().message())
            .to_string()
    }
}

impl From<rusqlite::Error> for TallyError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode as Sqlite;

        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
            _ => None,
        };

        match code {
            Some(Sqlite::DatabaseBusy | Sqlite::DatabaseLocked | Sqlite::CannotOpen) => {
                Self::StorageUnavailable(err)
            }
            Some(Sqlite::ConstraintViolation) => Self::ConstraintViolation(err),
            _ => Self::Storage(err),
        }
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::{ErrorCode, TallyError};
    use std::collections::HashSet;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::UnknownCategory,
            ErrorCode::MalformedPayload,
            ErrorCode::StorageUnavailable,
            ErrorCode::ConstraintViolation,
            ErrorCode::StorageFailure,
            ErrorCode::ConfigurationError,
            ErrorCode::LockContention,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::ConstraintViolation.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn busy_and_locked_are_transient() {
        let busy = TallyError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert_eq!(busy.code(), ErrorCode::StorageUnavailable);
        assert!(busy.code().is_transient());

        let locked = TallyError::from(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED));
        assert_eq!(locked.code(), ErrorCode::StorageUnavailable);
    }

    #[test]
    fn constraint_failures_are_classified() {
        let err = TallyError::from(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE));
        assert_eq!(err.code(), ErrorCode::ConstraintViolation);
        assert!(!err.code().is_transient());
    }

    #[test]
    fn other_sqlite_errors_are_storage_failures() {
        let err = TallyError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.code(), ErrorCode::StorageFailure);
    }

    #[test]
    fn json_errors_become_malformed_payloads() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = TallyError::from(parse);
        assert_eq!(err.code(), ErrorCode::MalformedPayload);
        assert_eq!(err.suggestion(), "Malformed event payload");
    }
}
