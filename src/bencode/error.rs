use thiserror::Error;

/// Errors raised while decoding bencode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer at offset {offset}: {reason}")]
    InvalidInteger { offset: usize, reason: &'static str },

    #[error("invalid string length at offset {0}")]
    InvalidStringLength(usize),

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    /// Dictionary key that is not a byte string.
    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),

    /// Raised by strict decoding only.
    #[error("dictionary key at offset {0} is out of order or repeated")]
    UnsortedKey(usize),

    #[error("{0} trailing bytes after value")]
    TrailingData(usize),

    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),
}
