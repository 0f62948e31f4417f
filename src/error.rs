use std::time::Duration;

use rusqlite::ErrorCode;

/// Errors raised by the persistence layer.
///
/// The variants follow how a caller should react: `Path`/`Permission` need an
/// operator to fix the environment, `Open`/`Corrupt` mean the file itself is
/// unusable, `Transient` is worth retrying, and `Timeout` means the caller's
/// deadline expired while the store was contended.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("metrics storage is disabled")]
    Disabled,

    #[error("metrics storage is not initialized: {0}")]
    Unavailable(String),

    #[error("invalid database path: {0}")]
    Path(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("cannot open database: {0}")]
    Open(String),

    #[error("database is corrupt or not a SQLite file: {0}")]
    Corrupt(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The store is busy rather than broken; a reader can fall back to memory.
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure) => {
                Self::Transient(err.to_string())
            }
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => Self::Corrupt(err.to_string()),
            Some(ErrorCode::CannotOpen) => Self::Open(err.to_string()),
            Some(ErrorCode::ReadOnly | ErrorCode::PermissionDenied) => Self::Permission(err.to_string()),
            _ => Self::Sqlite(err),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned synchronously by the query service.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("invalid pagination: {0}")]
    InvalidPage(String),

    #[error("listenAddr is required")]
    MissingListenAddr,

    #[error("range spans {requested} points, the limit is {max}")]
    TooManyPoints { requested: u64, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn classifies_sqlite_failures() {
        assert!(StoreError::from(failure(rusqlite::ffi::SQLITE_BUSY)).is_transient());
        assert!(matches!(
            StoreError::from(failure(rusqlite::ffi::SQLITE_NOTADB)),
            StoreError::Corrupt(_)
        ));
        assert!(matches!(
            StoreError::from(failure(rusqlite::ffi::SQLITE_CANTOPEN)),
            StoreError::Open(_)
        ));
        assert!(matches!(
            StoreError::from(failure(rusqlite::ffi::SQLITE_READONLY)),
            StoreError::Permission(_)
        ));
        assert!(matches!(
            StoreError::from(rusqlite::Error::QueryReturnedNoRows),
            StoreError::Sqlite(_)
        ));
    }

    #[test]
    fn timeout_message_reports_millis() {
        let err = StoreError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "storage operation timed out after 250ms");
        assert!(err.is_contended());
        assert!(!err.is_transient());
        assert!(!StoreError::Corrupt("x".into()).is_contended());
    }
}
