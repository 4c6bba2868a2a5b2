//! Error types for TDIMM
//!
//! Two layers of errors exist:
//! - [`Error`]: construction, configuration and metadata failures returned
//!   through `Result` by setup and management APIs.
//! - [`IoError`]: the result code delivered to a request's completion. It is
//!   `Copy` and maps to a stable numeric code so it can be stored in atomics.

use thiserror::Error;

/// Common result type for TDIMM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result delivered to a request completion
pub type IoResult = std::result::Result<(), IoError>;

/// Common error type for TDIMM
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("too many fragments: {count} exceeds maximum {max}")]
    TooManyFragments { count: usize, max: usize },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("illegal run-state transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("engine is dead")]
    EngineDead,

    #[error("member mismatch: {0}")]
    MemberMismatch(String),

    #[error("member slot {0} is occupied")]
    SlotOccupied(usize),

    #[error("member slot {0} is empty")]
    SlotEmpty(usize),

    #[error("no free member slot")]
    NoFreeSlot,

    #[error("unknown raid level: {0}")]
    UnknownRaidLevel(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a member mismatch error
    pub fn member_mismatch(msg: impl Into<String>) -> Self {
        Self::MemberMismatch(msg.into())
    }

    /// Create a corrupt metadata error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptMetadata(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the failed operation may succeed on a later attempt
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Timeout(_))
    }

    /// The request-level result this error maps onto
    #[must_use]
    pub fn io_error(&self) -> IoError {
        match self {
            Self::InvalidRequest(_) | Self::TooManyFragments { .. } | Self::Configuration(_) => {
                IoError::Invalid
            }
            Self::ResourceExhausted(_) => IoError::NoMemory,
            Self::Timeout(_) => IoError::Timeout,
            _ => IoError::Io,
        }
    }
}

/// Per-request failure code
///
/// Code 0 is reserved for success so that the numeric form can be used as a
/// sticky "first failure wins" slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum IoError {
    #[error("I/O error")]
    Io = 5,
    #[error("command timed out")]
    Timeout = 110,
    #[error("invalid request")]
    Invalid = 22,
    #[error("out of memory")]
    NoMemory = 12,
    #[error("operation aborted")]
    Aborted = 125,
    #[error("operation not supported")]
    Unsupported = 95,
}

impl IoError {
    /// Stable non-zero numeric code
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a numeric code; 0 and unknown codes yield `None` and `Io`
    /// respectively
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => None,
            110 => Some(Self::Timeout),
            22 => Some(Self::Invalid),
            12 => Some(Self::NoMemory),
            125 => Some(Self::Aborted),
            95 => Some(Self::Unsupported),
            _ => Some(Self::Io),
        }
    }

    /// Numeric form of a full result (0 on success)
    #[must_use]
    pub fn result_code(result: IoResult) -> u8 {
        result.err().map_or(0, Self::code)
    }

    /// Result form of a numeric code
    pub fn to_result(code: u8) -> IoResult {
        Self::from_code(code).map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_code_round_trip() {
        for err in [
            IoError::Io,
            IoError::Timeout,
            IoError::Invalid,
            IoError::NoMemory,
            IoError::Aborted,
            IoError::Unsupported,
        ] {
            assert_ne!(err.code(), 0);
            assert_eq!(IoError::from_code(err.code()), Some(err));
        }
        assert_eq!(IoError::from_code(0), None);
        assert_eq!(IoError::from_code(200), Some(IoError::Io));
    }

    #[test]
    fn test_result_code() {
        assert_eq!(IoError::result_code(Ok(())), 0);
        assert_eq!(IoError::result_code(Err(IoError::Timeout)), 110);
        assert_eq!(IoError::to_result(0), Ok(()));
        assert_eq!(IoError::to_result(5), Err(IoError::Io));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::ResourceExhausted("tokens").is_retryable());
        assert!(!Error::EngineDead.is_retryable());
        assert_eq!(Error::invalid_request("x").io_error(), IoError::Invalid);
        assert_eq!(Error::EngineDead.io_error(), IoError::Io);
    }
}
