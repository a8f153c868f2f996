//! Error types for PackDB
//!
//! `DbError` is the unified error type for all PackDB APIs. Every error maps
//! onto one of nine frozen status codes; the `(code, message)` pair is the
//! stable representation handed to `last_error()` and error listeners.
//!
//! | Code | Description |
//! |------|-------------|
//! | Ok | Success (never carried by `DbError`) |
//! | NotFound | Document, collection, or file not found |
//! | AlreadyExists | Entity already exists |
//! | InvalidArgument | Malformed input |
//! | ValidationFailed | Schema or unique-constraint rejection |
//! | IoError | Filesystem or serialization failure |
//! | Corrupted | Stored blob failed to decode |
//! | Busy | Resource temporarily unavailable |
//! | Unknown | Anything else |

use thiserror::Error;

/// Canonical status codes.
///
/// These nine codes are frozen; they are the wire representation of every
/// terminal status the database can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success
    Ok,
    /// Document, collection, or file not found
    NotFound,
    /// Entity already exists
    AlreadyExists,
    /// Malformed input
    InvalidArgument,
    /// Schema or unique-constraint rejection
    ValidationFailed,
    /// Filesystem or serialization failure
    IoError,
    /// Stored blob failed to decode
    Corrupted,
    /// Resource temporarily unavailable
    Busy,
    /// Anything else
    Unknown,
}

impl StatusCode {
    /// Canonical string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "Ok",
            StatusCode::NotFound => "NotFound",
            StatusCode::AlreadyExists => "AlreadyExists",
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::ValidationFailed => "ValidationFailed",
            StatusCode::IoError => "IoError",
            StatusCode::Corrupted => "Corrupted",
            StatusCode::Busy => "Busy",
            StatusCode::Unknown => "Unknown",
        }
    }

    /// Parse a status code from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Ok" => Some(StatusCode::Ok),
            "NotFound" => Some(StatusCode::NotFound),
            "AlreadyExists" => Some(StatusCode::AlreadyExists),
            "InvalidArgument" => Some(StatusCode::InvalidArgument),
            "ValidationFailed" => Some(StatusCode::ValidationFailed),
            "IoError" => Some(StatusCode::IoError),
            "Corrupted" => Some(StatusCode::Corrupted),
            "Busy" => Some(StatusCode::Busy),
            "Unknown" => Some(StatusCode::Unknown),
            _ => None,
        }
    }

    /// Human-readable description.
    pub fn describe(&self) -> &'static str {
        match self {
            StatusCode::Ok => "Ok",
            StatusCode::NotFound => "Not found",
            StatusCode::AlreadyExists => "Already exists",
            StatusCode::InvalidArgument => "Invalid argument",
            StatusCode::ValidationFailed => "Validation failed",
            StatusCode::IoError => "I/O error",
            StatusCode::Corrupted => "Corrupted",
            StatusCode::Busy => "Busy",
            StatusCode::Unknown => "Unknown",
        }
    }

    /// Check whether this code indicates a serious, non-retryable failure.
    pub fn is_serious(&self) -> bool {
        matches!(self, StatusCode::IoError | StatusCode::Corrupted)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type alias for PackDB operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Unified error type for all PackDB operations.
///
/// Each variant carries a human-readable message; `code()` maps the variant
/// onto the frozen [`StatusCode`] set. The type is `Clone` so a terminal
/// status can be snapshotted into `last_error()` without consuming it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    /// Document, collection, or file not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Schema or unique-constraint rejection
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Filesystem or serialization failure
    #[error("i/o error: {0}")]
    Io(String),

    /// Stored blob failed to decode
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// Resource temporarily unavailable
    #[error("busy: {0}")]
    Busy(String),

    /// Anything else
    #[error("unknown: {0}")]
    Unknown(String),
}

impl DbError {
    /// Create a NotFound error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        DbError::NotFound(msg.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(msg: impl Into<String>) -> Self {
        DbError::AlreadyExists(msg.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        DbError::InvalidArgument(msg.into())
    }

    /// Create a ValidationFailed error.
    pub fn validation(msg: impl Into<String>) -> Self {
        DbError::ValidationFailed(msg.into())
    }

    /// Create an IoError.
    pub fn io(msg: impl Into<String>) -> Self {
        DbError::Io(msg.into())
    }

    /// Create a Corrupted error.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        DbError::Corrupted(msg.into())
    }

    /// Map the variant onto its frozen status code.
    pub fn code(&self) -> StatusCode {
        match self {
            DbError::NotFound(_) => StatusCode::NotFound,
            DbError::AlreadyExists(_) => StatusCode::AlreadyExists,
            DbError::InvalidArgument(_) => StatusCode::InvalidArgument,
            DbError::ValidationFailed(_) => StatusCode::ValidationFailed,
            DbError::Io(_) => StatusCode::IoError,
            DbError::Corrupted(_) => StatusCode::Corrupted,
            DbError::Busy(_) => StatusCode::Busy,
            DbError::Unknown(_) => StatusCode::Unknown,
        }
    }

    /// The message without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            DbError::NotFound(m)
            | DbError::AlreadyExists(m)
            | DbError::InvalidArgument(m)
            | DbError::ValidationFailed(m)
            | DbError::Io(m)
            | DbError::Corrupted(m)
            | DbError::Busy(m)
            | DbError::Unknown(m) => m,
        }
    }

    /// Snapshot this error as a `(code, message)` status pair.
    pub fn status(&self) -> DbStatus {
        DbStatus {
            code: self.code(),
            message: self.message().to_string(),
        }
    }

    /// Check whether this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    /// Check whether this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, DbError::ValidationFailed(_))
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            DbError::NotFound(e.to_string())
        } else {
            DbError::Io(e.to_string())
        }
    }
}

/// Clonable `(code, message)` snapshot of a terminal status.
///
/// This is what `Database::last_error()` returns and what error listeners
/// receive. An `Ok` status carries an empty message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStatus {
    /// Status code
    pub code: StatusCode,
    /// Human-readable message; empty for `Ok`
    pub message: String,
}

impl DbStatus {
    /// The success status.
    pub fn ok() -> Self {
        DbStatus {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// Check for success.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Snapshot a result's terminal status.
    pub fn from_result<T>(r: &DbResult<T>) -> Self {
        match r {
            Ok(_) => DbStatus::ok(),
            Err(e) => e.status(),
        }
    }
}

impl Default for DbStatus {
    fn default() -> Self {
        DbStatus::ok()
    }
}

impl std::fmt::Display for DbStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_str() {
        let codes = [
            StatusCode::Ok,
            StatusCode::NotFound,
            StatusCode::AlreadyExists,
            StatusCode::InvalidArgument,
            StatusCode::ValidationFailed,
            StatusCode::IoError,
            StatusCode::Corrupted,
            StatusCode::Busy,
            StatusCode::Unknown,
        ];
        for code in codes {
            assert_eq!(StatusCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(StatusCode::parse("Turbo"), None);
    }

    #[test]
    fn error_maps_to_code() {
        assert_eq!(DbError::not_found("x").code(), StatusCode::NotFound);
        assert_eq!(DbError::validation("x").code(), StatusCode::ValidationFailed);
        assert_eq!(DbError::io("x").code(), StatusCode::IoError);
        assert_eq!(DbError::corrupted("x").code(), StatusCode::Corrupted);
    }

    #[test]
    fn status_snapshot_carries_message() {
        let st = DbError::validation("unique constraint violated").status();
        assert_eq!(st.code, StatusCode::ValidationFailed);
        assert_eq!(st.message, "unique constraint violated");
        assert!(!st.is_ok());
    }

    #[test]
    fn ok_status_is_empty() {
        let st = DbStatus::ok();
        assert!(st.is_ok());
        assert!(st.message.is_empty());
        assert_eq!(st.to_string(), "Ok");
    }

    #[test]
    fn from_result_snapshots_both_arms() {
        let ok: DbResult<u32> = Ok(1);
        assert!(DbStatus::from_result(&ok).is_ok());

        let err: DbResult<u32> = Err(DbError::not_found("document not found"));
        let st = DbStatus::from_result(&err);
        assert_eq!(st.code, StatusCode::NotFound);
    }

    #[test]
    fn io_error_conversion_preserves_not_found() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: DbError = missing.into();
        assert!(e.is_not_found());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        let e: DbError = denied.into();
        assert_eq!(e.code(), StatusCode::IoError);
    }

    #[test]
    fn display_includes_message() {
        let e = DbError::io("write failed");
        assert_eq!(e.to_string(), "i/o error: write failed");
    }
}
