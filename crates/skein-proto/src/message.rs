//! DNS message parsing and rendering.
//!
//! Parsed messages group the three record sections by owner name and then
//! by (type, covers), which is the shape response classification works on.
//! Rendering is uncompressed.

use crate::class::RecordClass;
use crate::error::Result;
use crate::header::{Header, HEADER_LEN};
use crate::name::Name;
use crate::question::Question;
use crate::rdata::RData;
use crate::rrset::{OwnerEntry, Rrset};
use crate::rtype::RecordType;
use crate::wire::WireReader;
use bytes::{BufMut, Bytes, BytesMut};

/// A record section of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// The answer section.
    Answer,
    /// The authority section.
    Authority,
    /// The additional section.
    Additional,
}

impl Section {
    #[inline]
    fn index(self) -> usize {
        match self {
            Section::Answer => 0,
            Section::Authority => 1,
            Section::Additional => 2,
        }
    }
}

/// EDNS0 information carried by an OPT pseudo-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edns {
    /// Advertised UDP payload size.
    pub udp_size: u16,
    /// EDNS version.
    pub version: u8,
    /// Extended rcode high bits.
    pub ext_rcode: u8,
}

impl Edns {
    /// An OPT advertising the given UDP payload size, version 0.
    pub fn advertising(udp_size: u16) -> Self {
        Self {
            udp_size,
            version: 0,
            ext_rcode: 0,
        }
    }
}

/// A complete DNS message.
#[derive(Debug, Clone)]
pub struct Message {
    /// The header. Section counts are recomputed on render.
    pub header: Header,
    /// Class applied to rendered records.
    pub class: RecordClass,
    /// The question section.
    pub questions: Vec<Question>,
    /// Answer, authority, additional; each grouped by owner name.
    sections: [Vec<OwnerEntry>; 3],
    /// EDNS0 OPT information, kept out of the additional section.
    pub edns: Option<Edns>,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self {
            header: Header::default(),
            class: RecordClass::IN,
            questions: Vec::new(),
            sections: [Vec::new(), Vec::new(), Vec::new()],
            edns: None,
        }
    }

    /// Creates a query carrying one question.
    pub fn query(question: Question) -> Self {
        let mut msg = Self::new();
        msg.class = question.class;
        msg.questions.push(question);
        msg
    }

    /// Creates a response echoing a query's id and question.
    pub fn response(query: &Message) -> Self {
        let mut msg = Self::new();
        msg.header.id = query.header.id;
        msg.header.qr = true;
        msg.header.opcode = query.header.opcode;
        msg.header.rd = query.header.rd;
        msg.questions = query.questions.clone();
        msg
    }

    /// Returns a section's owner entries.
    #[inline]
    pub fn section(&self, section: Section) -> &[OwnerEntry] {
        &self.sections[section.index()]
    }

    /// Mutable access to a section.
    #[inline]
    pub fn section_mut(&mut self, section: Section) -> &mut Vec<OwnerEntry> {
        &mut self.sections[section.index()]
    }

    /// Finds the owner entry for `name` in `section`.
    pub fn find_owner(&self, section: Section, name: &Name) -> Option<&OwnerEntry> {
        self.section(section).iter().find(|e| &e.name == name)
    }

    /// Mutable variant of [`Message::find_owner`].
    pub fn find_owner_mut(&mut self, section: Section, name: &Name) -> Option<&mut OwnerEntry> {
        self.section_mut(section)
            .iter_mut()
            .find(|e| &e.name == name)
    }

    /// Adds one record, grouping it into the right owner entry and rdataset.
    pub fn add_record(
        &mut self,
        section: Section,
        name: &Name,
        rtype: RecordType,
        ttl: u32,
        rdata: RData,
    ) {
        let covers = match &rdata {
            RData::Sig { covers, .. } => *covers,
            _ => RecordType::NONE,
        };
        let entries = self.section_mut(section);
        let pos = match entries.iter().position(|e| &e.name == name) {
            Some(pos) => pos,
            None => {
                entries.push(OwnerEntry::new(name.clone()));
                entries.len() - 1
            }
        };
        let owner = &mut entries[pos];
        match owner.find_mut(rtype, covers) {
            Some(rrset) => {
                rrset.absorb_ttl(ttl);
                rrset.rdatas.push(rdata);
            }
            None => {
                let mut rrset = if rtype == RecordType::SIG {
                    Rrset::new_sig(covers, ttl)
                } else {
                    Rrset::new(rtype, ttl)
                };
                rrset.rdatas.push(rdata);
                owner.rrsets.push(rrset);
            }
        }
    }

    /// Number of records in a section (rdatas, not rdatasets).
    pub fn record_count(&self, section: Section) -> usize {
        self.section(section)
            .iter()
            .flat_map(|e| e.rrsets.iter())
            .map(|r| r.rdatas.len())
            .sum()
    }

    /// Parses a full message.
    ///
    /// Truncated input yields [`Error::UnexpectedEnd`]; the caller can still
    /// recover the header via [`Header::parse`] and the question section via
    /// [`Message::parse_questions`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        let mut reader = WireReader::new(data);
        reader.set_position(HEADER_LEN);

        let mut msg = Self::new();
        msg.header = header;
        for _ in 0..header.qdcount {
            let question = Question::parse(&mut reader)?;
            msg.class = question.class;
            msg.questions.push(question);
        }

        let counts = [header.ancount, header.nscount, header.arcount];
        for (section_index, &count) in counts.iter().enumerate() {
            for _ in 0..count {
                let name = Name::parse(&mut reader)?;
                let rtype = RecordType(reader.read_u16()?);
                let class = RecordClass(reader.read_u16()?);
                let ttl = reader.read_u32()?;
                let rdlen = reader.read_u16()? as usize;

                if rtype == RecordType::OPT {
                    msg.edns = Some(Edns {
                        udp_size: class.0,
                        ext_rcode: (ttl >> 24) as u8,
                        version: (ttl >> 16) as u8,
                    });
                    reader.skip(rdlen)?;
                    continue;
                }

                let rdata = RData::parse(rtype, &mut reader, rdlen)?;
                let section = match section_index {
                    0 => Section::Answer,
                    1 => Section::Authority,
                    _ => Section::Additional,
                };
                msg.add_record(section, &name, rtype, ttl, rdata);
            }
        }

        // Reflect what was actually parsed (the OPT is carried separately).
        msg.header.qdcount = msg.questions.len() as u16;
        msg.header.ancount = msg.record_count(Section::Answer) as u16;
        msg.header.nscount = msg.record_count(Section::Authority) as u16;
        msg.header.arcount = msg.record_count(Section::Additional) as u16;
        Ok(msg)
    }

    /// Best-effort parse of the question section alone.
    ///
    /// Used when a truncated response fails a full parse but its question
    /// section is still intact.
    pub fn parse_questions(data: &[u8]) -> Result<Vec<Question>> {
        let header = Header::parse(data)?;
        let mut reader = WireReader::new(data);
        reader.set_position(HEADER_LEN);
        let mut questions = Vec::new();
        for _ in 0..header.qdcount {
            questions.push(Question::parse(&mut reader)?);
        }
        Ok(questions)
    }

    /// Renders the message, uncompressed.
    pub fn to_wire(&self) -> Bytes {
        let mut header = self.header;
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.record_count(Section::Answer) as u16;
        header.nscount = self.record_count(Section::Authority) as u16;
        header.arcount =
            (self.record_count(Section::Additional) + usize::from(self.edns.is_some())) as u16;

        let mut buf = BytesMut::with_capacity(512);
        header.write(&mut buf);
        for question in &self.questions {
            question.write(&mut buf);
        }
        for section in &self.sections {
            for owner in section {
                for rrset in &owner.rrsets {
                    for rdata in &rrset.rdatas {
                        owner.name.write(&mut buf);
                        buf.put_u16(rrset.rtype.0);
                        buf.put_u16(self.class.0);
                        buf.put_u32(rrset.ttl);
                        let mut rdata_buf = BytesMut::new();
                        rdata.write(&mut rdata_buf);
                        buf.put_u16(rdata_buf.len() as u16);
                        buf.extend_from_slice(&rdata_buf);
                    }
                }
            }
        }
        if let Some(edns) = &self.edns {
            Name::root().write(&mut buf);
            buf.put_u16(RecordType::OPT.0);
            buf.put_u16(edns.udp_size);
            buf.put_u32(((edns.ext_rcode as u32) << 24) | ((edns.version as u32) << 16));
            buf.put_u16(0);
        }
        buf.freeze()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn query_round_trip_preserves_question() {
        let mut msg = Message::query(Question::new(name("www.isc.org"), RecordType::A));
        msg.header.id = 0x1234;
        msg.edns = Some(Edns::advertising(2048));
        let wire = msg.to_wire();

        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].name, name("www.isc.org"));
        assert_eq!(parsed.questions[0].rtype, RecordType::A);
        assert_eq!(parsed.questions[0].class, RecordClass::IN);
        let edns = parsed.edns.unwrap();
        assert_eq!(edns.udp_size, 2048);
        assert_eq!(edns.version, 0);
        assert_eq!(parsed.record_count(Section::Additional), 0);
    }

    #[test]
    fn records_group_by_owner_and_type() {
        let mut msg = Message::new();
        msg.header.qr = true;
        let owner = name("isc.org");
        msg.add_record(
            Section::Answer,
            &owner,
            RecordType::A,
            300,
            RData::A(Ipv4Addr::new(192, 0, 2, 1)),
        );
        msg.add_record(
            Section::Answer,
            &owner,
            RecordType::A,
            120,
            RData::A(Ipv4Addr::new(192, 0, 2, 2)),
        );
        msg.add_record(
            Section::Answer,
            &owner,
            RecordType::SIG,
            60,
            RData::Sig {
                covers: RecordType::A,
                data: bytes::Bytes::from_static(&[0; 8]),
            },
        );

        let parsed = Message::parse(&msg.to_wire()).unwrap();
        let entries = parsed.section(Section::Answer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rrsets.len(), 2);
        let a = entries[0].find(RecordType::A, RecordType::NONE).unwrap();
        assert_eq!(a.rdatas.len(), 2);
        assert_eq!(a.ttl, 120);
        let sig = entries[0].find(RecordType::SIG, RecordType::A).unwrap();
        assert_eq!(sig.covers, RecordType::A);
    }

    #[test]
    fn truncated_message_reports_unexpected_end() {
        let mut msg = Message::query(Question::new(name("big.example"), RecordType::TXT));
        msg.header.tc = true;
        msg.header.qr = true;
        let wire = msg.to_wire();
        let cut = &wire[..wire.len() - 2];
        assert!(matches!(
            Message::parse(cut),
            Err(Error::UnexpectedEnd { .. })
        ));
        // Header and question still recoverable.
        let header = Header::parse(cut).unwrap();
        assert!(header.tc);
        let questions = Message::parse_questions(&wire).unwrap();
        assert_eq!(questions[0].name, name("big.example"));
    }
}
