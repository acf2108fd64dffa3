//! DNS record types.

use std::fmt;
use std::str::FromStr;

/// A DNS record type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    /// Placeholder for "no type"; used as the `covers` value of
    /// non-signature rdatasets.
    pub const NONE: Self = Self(0);
    /// IPv4 host address.
    pub const A: Self = Self(1);
    /// Authoritative nameserver.
    pub const NS: Self = Self(2);
    /// Canonical name alias.
    pub const CNAME: Self = Self(5);
    /// Start of authority.
    pub const SOA: Self = Self(6);
    /// Domain name pointer.
    pub const PTR: Self = Self(12);
    /// Mail exchange.
    pub const MX: Self = Self(15);
    /// Text strings.
    pub const TXT: Self = Self(16);
    /// Security signature.
    pub const SIG: Self = Self(24);
    /// Security key.
    pub const KEY: Self = Self(25);
    /// IPv6 host address.
    pub const AAAA: Self = Self(28);
    /// Next-domain (authenticated denial).
    pub const NXT: Self = Self(30);
    /// IPv6 address with prefix indirection.
    pub const A6: Self = Self(38);
    /// Non-terminal name redirection.
    pub const DNAME: Self = Self(39);
    /// EDNS0 pseudo-record.
    pub const OPT: Self = Self(41);
    /// Wildcard type (queries and negative-entry covers).
    pub const ANY: Self = Self(255);

    /// Returns true for address-bearing types eligible as glue.
    #[inline]
    pub fn is_address(self) -> bool {
        matches!(self, Self::A | Self::AAAA | Self::A6)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::A => "A",
            Self::NS => "NS",
            Self::CNAME => "CNAME",
            Self::SOA => "SOA",
            Self::PTR => "PTR",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::SIG => "SIG",
            Self::KEY => "KEY",
            Self::AAAA => "AAAA",
            Self::NXT => "NXT",
            Self::A6 => "A6",
            Self::DNAME => "DNAME",
            Self::OPT => "OPT",
            Self::ANY => "ANY",
            Self(other) => return write!(f, "TYPE{other}"),
        };
        f.write_str(s)
    }
}

impl FromStr for RecordType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s.to_ascii_uppercase().as_str() {
            "A" => Self::A,
            "NS" => Self::NS,
            "CNAME" => Self::CNAME,
            "SOA" => Self::SOA,
            "PTR" => Self::PTR,
            "MX" => Self::MX,
            "TXT" => Self::TXT,
            "SIG" => Self::SIG,
            "KEY" => Self::KEY,
            "AAAA" => Self::AAAA,
            "NXT" => Self::NXT,
            "A6" => Self::A6,
            "DNAME" => Self::DNAME,
            "ANY" => Self::ANY,
            other => {
                return other
                    .strip_prefix("TYPE")
                    .and_then(|n| n.parse().ok())
                    .map(Self)
                    .ok_or_else(|| {
                        crate::error::Error::BadNameText(format!("unknown type {s:?}"))
                    });
            }
        };
        Ok(t)
    }
}
