//! DNS operation codes.

use std::fmt;

/// A DNS opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u8);

impl Opcode {
    /// Standard query.
    pub const QUERY: Self = Self(0);
    /// Inverse query (obsolete).
    pub const IQUERY: Self = Self(1);
    /// Server status request.
    pub const STATUS: Self = Self(2);
    /// Zone change notification.
    pub const NOTIFY: Self = Self(4);
    /// Dynamic update.
    pub const UPDATE: Self = Self(5);
}

impl Default for Opcode {
    fn default() -> Self {
        Self::QUERY
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::QUERY => f.write_str("QUERY"),
            Self::IQUERY => f.write_str("IQUERY"),
            Self::STATUS => f.write_str("STATUS"),
            Self::NOTIFY => f.write_str("NOTIFY"),
            Self::UPDATE => f.write_str("UPDATE"),
            Self(other) => write!(f, "OPCODE{other}"),
        }
    }
}
