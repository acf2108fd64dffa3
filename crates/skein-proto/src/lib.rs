//! # skein-proto
//!
//! DNS wire format for the skein resolver: domain names, messages with
//! owner-grouped rdatasets, typed rdata for the record types the resolver
//! interprets, and EDNS0 OPT handling.
//!
//! The section model differs from a flat record list on purpose: records
//! are grouped by owner name and (type, covers) so that response
//! classification can annotate names and rdatasets in place and the
//! caching layer can walk the marks.

pub mod class;
pub mod error;
pub mod header;
pub mod message;
pub mod name;
pub mod opcode;
pub mod question;
pub mod rcode;
pub mod rdata;
pub mod rrset;
pub mod rtype;
pub mod wire;

pub use class::RecordClass;
pub use error::{Error, Result};
pub use header::{Header, HEADER_LEN};
pub use message::{Edns, Message, Section};
pub use name::{Name, MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
pub use opcode::Opcode;
pub use question::Question;
pub use rcode::Rcode;
pub use rdata::RData;
pub use rrset::{OwnerEntry, Rrset, Trust};
pub use rtype::RecordType;
pub use wire::WireReader;
