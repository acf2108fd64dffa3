//! The fixed DNS message header.

use crate::error::{Error, Result};
use crate::opcode::Opcode;
use crate::rcode::Rcode;
use crate::wire::WireReader;
use bytes::{BufMut, BytesMut};

/// Wire size of the header.
pub const HEADER_LEN: usize = 12;

/// The 12-byte DNS message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Message id.
    pub id: u16,
    /// Response flag.
    pub qr: bool,
    /// Operation code.
    pub opcode: Opcode,
    /// Authoritative answer.
    pub aa: bool,
    /// Truncated.
    pub tc: bool,
    /// Recursion desired.
    pub rd: bool,
    /// Recursion available.
    pub ra: bool,
    /// Response code.
    pub rcode: Rcode,
    /// Question count.
    pub qdcount: u16,
    /// Answer count.
    pub ancount: u16,
    /// Authority count.
    pub nscount: u16,
    /// Additional count.
    pub arcount: u16,
}

impl Header {
    /// Parses a header from the front of `data`.
    ///
    /// Usable on its own so the TC bit of an otherwise unparseable
    /// (truncated) response stays observable.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::UnexpectedEnd { offset: data.len() });
        }
        let mut reader = WireReader::new(data);
        let id = reader.read_u16()?;
        let flags = reader.read_u16()?;
        Ok(Self {
            id,
            qr: flags & 0x8000 != 0,
            opcode: Opcode(((flags >> 11) & 0x0f) as u8),
            aa: flags & 0x0400 != 0,
            tc: flags & 0x0200 != 0,
            rd: flags & 0x0100 != 0,
            ra: flags & 0x0080 != 0,
            rcode: Rcode((flags & 0x000f) as u8),
            qdcount: reader.read_u16()?,
            ancount: reader.read_u16()?,
            nscount: reader.read_u16()?,
            arcount: reader.read_u16()?,
        })
    }

    /// Appends the wire form to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        let mut flags = 0u16;
        if self.qr {
            flags |= 0x8000;
        }
        flags |= ((self.opcode.0 & 0x0f) as u16) << 11;
        if self.aa {
            flags |= 0x0400;
        }
        if self.tc {
            flags |= 0x0200;
        }
        if self.rd {
            flags |= 0x0100;
        }
        if self.ra {
            flags |= 0x0080;
        }
        flags |= (self.rcode.0 & 0x0f) as u16;

        buf.put_u16(self.id);
        buf.put_u16(flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = Header {
            id: 0xbeef,
            qr: true,
            opcode: Opcode::QUERY,
            aa: true,
            tc: false,
            rd: true,
            ra: true,
            rcode: Rcode::NXDOMAIN,
            qdcount: 1,
            ancount: 0,
            nscount: 1,
            arcount: 0,
        };
        let mut buf = BytesMut::new();
        hdr.write(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(Header::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn short_header_is_unexpected_end() {
        assert!(matches!(
            Header::parse(&[0; 4]),
            Err(Error::UnexpectedEnd { .. })
        ));
    }
}
