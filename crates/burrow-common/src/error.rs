//! Error handling for BurrowDB.
//!
//! Provides the unified error type returned by every fallible engine
//! operation, plus a stable error-code taxonomy for programmatic handling.

use thiserror::Error;

/// Result type alias for BurrowDB operations.
pub type BurrowResult<T> = std::result::Result<T, BurrowError>;

/// Error codes for categorizing errors.
///
/// These codes are stable across versions and group errors into the
/// engine's four failure classes: transient, absent, corruption, and I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0002,

    /// Resource is busy; retry later.
    Busy = 0x0100,
    /// Named resource does not exist.
    NotFound = 0x0101,

    /// Data corruption or invariant violation.
    Corruption = 0x0200,

    /// General I/O error.
    Io = 0x0300,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Availability",
            0x02 => "Corruption",
            0x03 => "I/O",
            _ => "Unknown",
        }
    }
}

/// The main error type for BurrowDB.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// The resource is held by another thread; the caller should retry.
    #[error("resource busy: {resource}")]
    Busy {
        /// The contended resource.
        resource: String,
    },

    /// A named object (table, checkpoint, catalog entry) does not exist.
    #[error("not found: {name}")]
    NotFound {
        /// The missing name.
        name: String,
    },

    /// Data corruption or a broken structural invariant.
    ///
    /// Fatal for the object involved; debug builds also assert.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// I/O error from the underlying system, propagated unchanged.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Invalid configuration string or value.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl BurrowError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Busy { .. } => ErrorCode::Busy,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::Io { .. } => ErrorCode::Io,
            Self::InvalidConfig { .. } => ErrorCode::InvalidArgument,
        }
    }

    /// Returns true if this error is transient and the operation may be
    /// retried unchanged.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a busy error for the named resource.
    #[must_use]
    pub fn busy(resource: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
        }
    }

    /// Creates a not-found error for the named object.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a corruption error.
    ///
    /// Debug builds abort at the point of detection; corruption is never an
    /// expected condition.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        let message = message.into();
        debug_assert!(false, "corruption detected: {message}");
        Self::Corruption { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = BurrowError::busy("handle table:a");
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(err.code().category(), "Availability");
    }

    #[test]
    fn test_error_display() {
        let err = BurrowError::not_found("table:missing");
        assert_eq!(err.to_string(), "not found: table:missing");
    }

    #[test]
    fn test_transient() {
        assert!(BurrowError::busy("x").is_transient());
        assert!(!BurrowError::not_found("x").is_transient());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BurrowError = io_err.into();
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
