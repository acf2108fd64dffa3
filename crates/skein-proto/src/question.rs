//! The question section entry.

use crate::class::RecordClass;
use crate::error::Result;
use crate::name::Name;
use crate::rtype::RecordType;
use crate::wire::WireReader;
use bytes::{BufMut, BytesMut};
use std::fmt;

/// One DNS question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    /// Queried name.
    pub name: Name,
    /// Queried type.
    pub rtype: RecordType,
    /// Queried class.
    pub class: RecordClass,
}

impl Question {
    /// Creates a question in the Internet class.
    pub fn new(name: Name, rtype: RecordType) -> Self {
        Self {
            name,
            rtype,
            class: RecordClass::IN,
        }
    }

    /// Parses a question entry.
    pub fn parse(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            name: Name::parse(reader)?,
            rtype: RecordType(reader.read_u16()?),
            class: RecordClass(reader.read_u16()?),
        })
    }

    /// Appends the wire form to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        self.name.write(buf);
        buf.put_u16(self.rtype.0);
        buf.put_u16(self.class.0);
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.class, self.rtype)
    }
}
