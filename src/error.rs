//! Error types
//!
//! `Error` is the crate-wide error returned by the socket-facing front-ends.
//! The synchronous engines report narrower errors (`ProtocolError`,
//! `RegistryError`, `FragmentError`) that convert into it.

use std::fmt;
use std::io;

pub use crate::registry::RegistryError;

/// Result alias used by the socket-facing parts of the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug)]
pub enum Error {
    /// Socket I/O failed
    Io(io::Error),
    /// Peer sent something the framer could not accept
    Protocol(ProtocolError),
    /// Subscription registry rejected an operation
    Registry(RegistryError),
    /// Fragment could not be merged
    Fragment(FragmentError),
    /// Peer closed the connection
    ConnectionClosed,
    /// Operation timed out
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Fragment(e) => write!(f, "Fragment error: {}", e),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Timeout => write!(f, "Timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::Fragment(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<FragmentError> for Error {
    fn from(e: FragmentError) -> Self {
        Error::Fragment(e)
    }
}

/// Wire-level protocol errors
///
/// Raised for recognized keywords with bad arguments. Unknown keywords are
/// skipped by the parser and never produce one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wrong number of arguments for a keyword
    ArgumentCount {
        keyword: &'static str,
        got: usize,
    },
    /// Byte-count or max-msgs field missing or not decimal
    BadNumber(&'static str),
    /// Announced payload larger than the negotiated maximum
    PayloadTooLarge { size: usize, max: usize },
    /// Header line exceeded the control line limit without a terminator
    LineTooLong { len: usize, max: usize },
    /// Subject failed validation (pedantic mode)
    InvalidSubject(String),
    /// Message not expected in the current role or state
    UnexpectedMessage(String),
    /// Remote side reported `-ERR`
    Remote(String),
}

impl ProtocolError {
    /// Text sent back to the peer in a `-ERR` line
    pub fn reply_text(&self) -> &'static str {
        match self {
            ProtocolError::ArgumentCount { .. } | ProtocolError::BadNumber(_) => {
                "Unknown Protocol Operation"
            }
            ProtocolError::PayloadTooLarge { .. } => "Maximum Payload Violation",
            ProtocolError::LineTooLong { .. } => "Maximum Control Line Exceeded",
            ProtocolError::InvalidSubject(_) => "Invalid Subject",
            ProtocolError::UnexpectedMessage(_) | ProtocolError::Remote(_) => {
                "Unknown Protocol Operation"
            }
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ArgumentCount { keyword, got } => {
                write!(f, "{} with {} arguments", keyword, got)
            }
            ProtocolError::BadNumber(field) => write!(f, "Bad numeric field: {}", field),
            ProtocolError::PayloadTooLarge { size, max } => {
                write!(f, "Payload of {} bytes exceeds max {}", size, max)
            }
            ProtocolError::LineTooLong { len, max } => {
                write!(f, "Control line of {} bytes exceeds max {}", len, max)
            }
            ProtocolError::InvalidSubject(s) => write!(f, "Invalid subject: {}", s),
            ProtocolError::UnexpectedMessage(m) => write!(f, "Unexpected message: {}", m),
            ProtocolError::Remote(m) => write!(f, "Remote error: {}", m),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Fragment reassembly errors
///
/// These never reach the peer; the in-progress group is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// First fragment of a group did not start at offset 0
    NotAtHead { offset: u32 },
    /// Offset did not continue the bytes already received
    OutOfOrder { expected: u32, got: u32 },
    /// Total length does not exceed the maximum frame size
    TooSmall { total: u32, max: usize },
    /// Fragment body would overrun the announced total length
    Overrun { end: usize, total: u32 },
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentError::NotAtHead { offset } => {
                write!(f, "Fragment group does not start at 0 (offset {})", offset)
            }
            FragmentError::OutOfOrder { expected, got } => {
                write!(f, "Fragment offset {} but expected {}", got, expected)
            }
            FragmentError::TooSmall { total, max } => {
                write!(f, "Fragment total {} is not larger than max {}", total, max)
            }
            FragmentError::Overrun { end, total } => {
                write!(f, "Fragment ends at {} past total {}", end, total)
            }
        }
    }
}

impl std::error::Error for FragmentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_reply_text() {
        let err = ProtocolError::PayloadTooLarge { size: 10, max: 5 };
        assert_eq!(err.reply_text(), "Maximum Payload Violation");

        let err = ProtocolError::ArgumentCount {
            keyword: "SUB",
            got: 1,
        };
        assert_eq!(err.reply_text(), "Unknown Protocol Operation");
    }

    #[test]
    fn test_error_conversions() {
        let err: Error = ProtocolError::BadNumber("size").into();
        assert!(matches!(err, Error::Protocol(ProtocolError::BadNumber(_))));

        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
