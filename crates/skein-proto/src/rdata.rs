//! Typed record data with an opaque fallback.
//!
//! Only the types the resolver inspects get structured variants; anything
//! else is carried as raw bytes so it can be cached and re-served.

use crate::error::{Error, Result};
use crate::name::Name;
use crate::rtype::RecordType;
use crate::wire::WireReader;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    /// IPv4 address.
    A(Ipv4Addr),
    /// IPv6 address.
    Aaaa(Ipv6Addr),
    /// IPv6 address with prefix indirection (RFC 2874).
    A6 {
        /// Number of leading bits supplied by the prefix name.
        prefix_len: u8,
        /// Address suffix (low `128 - prefix_len` bits).
        suffix: Ipv6Addr,
        /// Prefix name, present when `prefix_len > 0`.
        prefix: Option<Name>,
    },
    /// Authoritative nameserver.
    Ns(Name),
    /// Canonical name alias.
    Cname(Name),
    /// Subtree redirection.
    Dname(Name),
    /// Reverse pointer.
    Ptr(Name),
    /// Mail exchange.
    Mx {
        /// Preference (lower wins).
        preference: u16,
        /// Exchange host.
        exchange: Name,
    },
    /// Start of authority.
    Soa {
        /// Primary master name.
        mname: Name,
        /// Responsible mailbox name.
        rname: Name,
        /// Zone serial.
        serial: u32,
        /// Refresh interval.
        refresh: u32,
        /// Retry interval.
        retry: u32,
        /// Expiry bound.
        expire: u32,
        /// Minimum/negative TTL.
        minimum: u32,
    },
    /// Text strings.
    Txt(Vec<Bytes>),
    /// Security signature; only the covered type is interpreted.
    Sig {
        /// The type this signature covers.
        covers: RecordType,
        /// The remainder of the rdata, uninterpreted.
        data: Bytes,
    },
    /// Uninterpreted rdata for any other type.
    Unknown(Bytes),
}

impl RData {
    /// Parses rdata of the given type from a window of `rdlen` bytes.
    ///
    /// The reader must be positioned at the start of the rdata within the
    /// full message (names inside rdata may use compression pointers).
    pub fn parse(rtype: RecordType, reader: &mut WireReader<'_>, rdlen: usize) -> Result<Self> {
        let start = reader.position();
        let end = start + rdlen;
        if end > reader.data().len() {
            return Err(Error::UnexpectedEnd { offset: end });
        }

        let rdata = match rtype {
            RecordType::A => {
                let octets = reader.read_slice(4)?;
                RData::A(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
            }
            RecordType::AAAA => {
                let octets: [u8; 16] = reader
                    .read_slice(16)?
                    .try_into()
                    .map_err(|_| Error::UnexpectedEnd { offset: end })?;
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::A6 => {
                let prefix_len = reader.read_u8()?;
                if prefix_len > 128 {
                    return Err(Error::FormErr {
                        reason: "A6 prefix length over 128",
                    });
                }
                let suffix_bytes = (128 - prefix_len as usize).div_ceil(8);
                let mut octets = [0u8; 16];
                let suffix = reader.read_slice(suffix_bytes)?;
                octets[16 - suffix_bytes..].copy_from_slice(suffix);
                let prefix = if prefix_len > 0 {
                    Some(Name::parse(reader)?)
                } else {
                    None
                };
                RData::A6 {
                    prefix_len,
                    suffix: Ipv6Addr::from(octets),
                    prefix,
                }
            }
            RecordType::NS => RData::Ns(Name::parse(reader)?),
            RecordType::CNAME => RData::Cname(Name::parse(reader)?),
            RecordType::DNAME => RData::Dname(Name::parse(reader)?),
            RecordType::PTR => RData::Ptr(Name::parse(reader)?),
            RecordType::MX => RData::Mx {
                preference: reader.read_u16()?,
                exchange: Name::parse(reader)?,
            },
            RecordType::SOA => RData::Soa {
                mname: Name::parse(reader)?,
                rname: Name::parse(reader)?,
                serial: reader.read_u32()?,
                refresh: reader.read_u32()?,
                retry: reader.read_u32()?,
                expire: reader.read_u32()?,
                minimum: reader.read_u32()?,
            },
            RecordType::TXT => {
                let mut strings = Vec::new();
                while reader.position() < end {
                    let len = reader.read_u8()? as usize;
                    strings.push(Bytes::copy_from_slice(reader.read_slice(len)?));
                }
                RData::Txt(strings)
            }
            RecordType::SIG => {
                if rdlen < 2 {
                    return Err(Error::UnexpectedEnd { offset: end });
                }
                let covers = RecordType(reader.read_u16()?);
                let data = Bytes::copy_from_slice(reader.read_slice(rdlen - 2)?);
                RData::Sig { covers, data }
            }
            _ => RData::Unknown(Bytes::copy_from_slice(reader.read_slice(rdlen)?)),
        };

        if reader.position() > end {
            return Err(Error::FormErr {
                reason: "rdata overruns its declared length",
            });
        }
        // Trailing unparsed bytes within the window are skipped.
        reader.set_position(end);
        Ok(rdata)
    }

    /// Appends the uncompressed wire form to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            RData::A(addr) => buf.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
            RData::A6 {
                prefix_len,
                suffix,
                prefix,
            } => {
                buf.put_u8(*prefix_len);
                let suffix_bytes = (128 - *prefix_len as usize).div_ceil(8);
                buf.extend_from_slice(&suffix.octets()[16 - suffix_bytes..]);
                if let Some(prefix) = prefix {
                    prefix.write(buf);
                }
            }
            RData::Ns(name) | RData::Cname(name) | RData::Dname(name) | RData::Ptr(name) => {
                name.write(buf);
            }
            RData::Mx {
                preference,
                exchange,
            } => {
                buf.put_u16(*preference);
                exchange.write(buf);
            }
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.write(buf);
                rname.write(buf);
                buf.put_u32(*serial);
                buf.put_u32(*refresh);
                buf.put_u32(*retry);
                buf.put_u32(*expire);
                buf.put_u32(*minimum);
            }
            RData::Txt(strings) => {
                for s in strings {
                    buf.put_u8(s.len() as u8);
                    buf.extend_from_slice(s);
                }
            }
            RData::Sig { covers, data } => {
                buf.put_u16(covers.0);
                buf.extend_from_slice(data);
            }
            RData::Unknown(data) => buf.extend_from_slice(data),
        }
    }

    /// Returns the target name for alias-like rdata.
    pub fn target_name(&self) -> Option<&Name> {
        match self {
            RData::Ns(name) | RData::Cname(name) | RData::Dname(name) | RData::Ptr(name) => {
                Some(name)
            }
            _ => None,
        }
    }

    /// Returns the owner name whose address records would complete this
    /// rdata in the additional section, if any.
    pub fn additional_name(&self) -> Option<&Name> {
        match self {
            RData::Ns(name) => Some(name),
            RData::Mx { exchange, .. } => Some(exchange),
            RData::A6 {
                prefix: Some(name), ..
            } => Some(name),
            _ => None,
        }
    }
}

// Presentation format, close enough to master-file syntax for logs and the
// command-line harness.
impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RData::A(addr) => write!(f, "{addr}"),
            RData::Aaaa(addr) => write!(f, "{addr}"),
            RData::A6 {
                prefix_len,
                suffix,
                prefix,
            } => match prefix {
                Some(p) => write!(f, "{prefix_len} {suffix} {p}"),
                None => write!(f, "{prefix_len} {suffix}"),
            },
            RData::Ns(name) | RData::Cname(name) | RData::Dname(name) | RData::Ptr(name) => {
                write!(f, "{name}")
            }
            RData::Mx {
                preference,
                exchange,
            } => write!(f, "{preference} {exchange}"),
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(
                f,
                "{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"
            ),
            RData::Txt(strings) => {
                for (i, s) in strings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "\"{}\"", String::from_utf8_lossy(s))?;
                }
                Ok(())
            }
            RData::Sig { covers, data } => write!(f, "{covers} ({} bytes)", data.len()),
            RData::Unknown(data) => write!(f, "\\# {} bytes", data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn round_trip(rtype: RecordType, rdata: &RData) {
        let mut buf = BytesMut::new();
        rdata.write(&mut buf);
        let bytes = buf.freeze();
        let mut reader = WireReader::new(&bytes);
        let parsed = RData::parse(rtype, &mut reader, bytes.len()).unwrap();
        assert_eq!(&parsed, rdata);
    }

    #[test]
    fn typed_round_trips() {
        round_trip(RecordType::A, &RData::A(Ipv4Addr::new(192, 0, 2, 1)));
        round_trip(RecordType::AAAA, &RData::Aaaa("2001:db8::1".parse().unwrap()));
        round_trip(RecordType::NS, &RData::Ns(Name::from_str("ns1.isc.org").unwrap()));
        round_trip(
            RecordType::MX,
            &RData::Mx {
                preference: 10,
                exchange: Name::from_str("mx.isc.org").unwrap(),
            },
        );
        round_trip(
            RecordType::SOA,
            &RData::Soa {
                mname: Name::from_str("ns.isc.org").unwrap(),
                rname: Name::from_str("hostmaster.isc.org").unwrap(),
                serial: 2024_01_01,
                refresh: 7200,
                retry: 3600,
                expire: 604800,
                minimum: 900,
            },
        );
        round_trip(
            RecordType::TXT,
            &RData::Txt(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]),
        );
    }

    #[test]
    fn sig_covers_is_extracted() {
        let sig = RData::Sig {
            covers: RecordType::A,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        round_trip(RecordType::SIG, &sig);
        match sig {
            RData::Sig { covers, .. } => assert_eq!(covers, RecordType::A),
            _ => unreachable!(),
        }
    }

    #[test]
    fn additional_names() {
        let ns = RData::Ns(Name::from_str("ns1.org").unwrap());
        assert_eq!(
            ns.additional_name().unwrap(),
            &Name::from_str("ns1.org").unwrap()
        );
        assert!(RData::A(Ipv4Addr::LOCALHOST).additional_name().is_none());
    }

    #[test]
    fn short_rdata_is_rejected() {
        let data = [0u8; 2];
        let mut reader = WireReader::new(&data);
        assert!(RData::parse(RecordType::A, &mut reader, 4).is_err());
    }
}
