use bytes::Bytes;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A decodable query that must be answered with a KRPC error.
    #[error("protocol error {code}: {message}")]
    Protocol {
        transaction_id: Bytes,
        code: ErrorCode,
        message: String,
    },

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("engine has been disposed")]
    Disposed,

    #[error("main loop is not running")]
    MainLoopClosed,
}

/// KRPC error codes from BEP-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    Server,
    Protocol,
    MethodUnknown,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Generic => 201,
            ErrorCode::Server => 202,
            ErrorCode::Protocol => 203,
            ErrorCode::MethodUnknown => 204,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            201 => Some(ErrorCode::Generic),
            202 => Some(ErrorCode::Server),
            203 => Some(ErrorCode::Protocol),
            204 => Some(ErrorCode::MethodUnknown),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
