//! DNS protocol error types.

use thiserror::Error;

/// Result type alias for wire-format operations.
pub type Result<T> = std::result::Result<T, Error>;

/// DNS wire-format errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message ended before the expected data.
    ///
    /// Distinguished from [`Error::FormErr`] because a short message may
    /// still be a legitimate truncated response (TC bit set).
    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEnd {
        /// Byte offset where the data ran out.
        offset: usize,
    },

    /// The message violates the wire format.
    #[error("malformed message: {reason}")]
    FormErr {
        /// What was malformed.
        reason: &'static str,
    },

    /// A label exceeds 63 bytes.
    #[error("label too long: {0} bytes")]
    LabelTooLong(usize),

    /// A name exceeds 255 bytes of wire form.
    #[error("name too long: {0} bytes")]
    NameTooLong(usize),

    /// A constructed name does not fit the wire-form limit.
    ///
    /// Reported separately from [`Error::NameTooLong`] because callers
    /// synthesizing names (DNAME substitution) treat it as a soft stop
    /// rather than a protocol violation.
    #[error("constructed name does not fit: {0} bytes")]
    NoSpace(usize),

    /// A compression pointer is out of bounds or malformed.
    #[error("bad compression pointer at offset {0}")]
    BadPointer(usize),

    /// Too many compression pointer jumps in one name.
    #[error("too many compression pointer jumps")]
    TooManyJumps,

    /// Text form of a name could not be parsed.
    #[error("invalid name text: {0}")]
    BadNameText(String),
}
