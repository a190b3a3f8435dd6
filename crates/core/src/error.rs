//! Unified error types for reqcache.
//!
//! Display strings carry a stable upper-case prefix so callers and logs can
//! classify failures without matching on variants.

use tokio_rusqlite::rusqlite;

/// Unified error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration value (unknown option value, bad header name, ...).
    #[error("CONFIG_ERROR: {0}")]
    Config(String),

    /// Backend alias not present in the registry.
    #[error("CONFIG_ERROR: unknown backend `{name}` (expected one of: {expected})")]
    UnknownBackend { name: String, expected: String },

    /// Serializer name not present in the registry.
    #[error("CONFIG_ERROR: unknown serializer `{name}` (expected one of: {expected})")]
    UnknownSerializer { name: String, expected: String },

    /// Backend was compiled out; raised when it is instantiated.
    #[error("MISSING_DEPENDENCY: backend `{backend}` requires the `{feature}` feature")]
    MissingDependency { backend: &'static str, feature: &'static str },

    /// Dict-style access to a key that is not stored.
    #[error("KEY_NOT_FOUND: {0}")]
    KeyNotFound(String),

    /// Stored value could not be turned back into a response.
    #[error("DESERIALIZE_FAILED: {0}")]
    Deserialization(String),

    /// Response could not be turned into a storable value.
    #[error("SERIALIZE_FAILED: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Filesystem operation failed.
    #[error("CACHE_ERROR: {0}")]
    Io(#[from] std::io::Error),

    /// Remote storage (redis, mongodb, dynamodb) reported an error.
    #[error("BACKEND_ERROR: {0}")]
    Backend(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Transport failure while talking to the origin.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),
}

impl Error {
    /// True for SQLite `SQLITE_BUSY` / `SQLITE_LOCKED` failures, which are worth retrying.
    pub fn is_database_locked(&self) -> bool {
        match self {
            Error::Database(tokio_rusqlite::Error::Error(rusqlite::Error::SqliteFailure(err, _))) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// True for the missing-key error used by dict-style access.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound(_))
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::KeyNotFound("abc123".to_string());
        assert!(err.to_string().contains("KEY_NOT_FOUND"));
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_unknown_backend_lists_aliases() {
        let err = Error::UnknownBackend { name: "couch".into(), expected: "memory, sqlite".into() };
        let text = err.to_string();
        assert!(text.starts_with("CONFIG_ERROR"));
        assert!(text.contains("memory, sqlite"));
    }

    #[test]
    fn test_database_locked_detection() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: rusqlite::ErrorCode::DatabaseBusy, extended_code: 5 },
            Some("database is locked".into()),
        );
        assert!(Error::from(busy).is_database_locked());
        assert!(!Error::KeyNotFound("k".into()).is_database_locked());
    }
}
