//! DNS record classes.

use std::fmt;
use std::str::FromStr;

/// A DNS record class code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordClass(pub u16);

impl RecordClass {
    /// The Internet class.
    pub const IN: Self = Self(1);
    /// The Chaos class.
    pub const CH: Self = Self(3);
    /// The Hesiod class.
    pub const HS: Self = Self(4);
    /// Wildcard class (queries only).
    pub const ANY: Self = Self(255);
}

impl Default for RecordClass {
    fn default() -> Self {
        Self::IN
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IN => f.write_str("IN"),
            Self::CH => f.write_str("CH"),
            Self::HS => f.write_str("HS"),
            Self::ANY => f.write_str("ANY"),
            Self(other) => write!(f, "CLASS{other}"),
        }
    }
}

impl FromStr for RecordClass {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IN" => Ok(Self::IN),
            "CH" => Ok(Self::CH),
            "HS" => Ok(Self::HS),
            "ANY" => Ok(Self::ANY),
            other => other
                .strip_prefix("CLASS")
                .and_then(|n| n.parse().ok())
                .map(Self)
                .ok_or_else(|| crate::error::Error::BadNameText(format!("unknown class {s:?}"))),
        }
    }
}
