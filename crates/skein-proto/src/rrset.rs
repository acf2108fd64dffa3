//! Rdataset grouping with trust levels and classification marks.
//!
//! Records sharing an owner name are grouped into rdatasets keyed by
//! (type, covered type). Response classification annotates both the owner
//! names and the rdatasets in place; the caching layer later walks the
//! marks. Trust records how much a cached rdataset's provenance is worth;
//! the cache refuses downgrades.

use crate::name::Name;
use crate::rdata::RData;
use crate::rtype::RecordType;
use std::fmt;

/// How trustworthy a cached rdataset's provenance is, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trust {
    /// Appeared in an additional section.
    Additional,
    /// Glue from a referral.
    Glue,
    /// Non-authoritative answer data.
    Answer,
    /// Authoritative authority-section data.
    AuthAuthority,
    /// Authoritative answer data.
    AuthAnswer,
}

/// A set of records of one type under one owner name.
#[derive(Debug, Clone)]
pub struct Rrset {
    /// Record type.
    pub rtype: RecordType,
    /// Covered type for signatures; [`RecordType::NONE`] otherwise.
    pub covers: RecordType,
    /// Time to live, the minimum across the grouped records.
    pub ttl: u32,
    /// The record data.
    pub rdatas: Vec<RData>,
    /// Provenance trust, assigned during classification.
    pub trust: Trust,
    /// Classification marks ([`Rrset::CACHE`] and friends).
    pub attributes: u8,
}

impl Rrset {
    /// Marked cacheable.
    pub const CACHE: u8 = 0x01;
    /// This rdataset is the answer to the question.
    pub const ANSWER: u8 = 0x02;
    /// This rdataset signs the answer.
    pub const ANSWERSIG: u8 = 0x04;
    /// Owner lies outside the current query domain; cacheable only after
    /// validation.
    pub const EXTERNAL: u8 = 0x08;
    /// Part of a CNAME/DNAME chain.
    pub const CHAINING: u8 = 0x10;
    /// Belongs to a negative-cache entry.
    pub const NCACHE: u8 = 0x20;

    /// Creates an empty rdataset.
    pub fn new(rtype: RecordType, ttl: u32) -> Self {
        Self {
            rtype,
            covers: RecordType::NONE,
            ttl,
            rdatas: Vec::new(),
            trust: Trust::Additional,
            attributes: 0,
        }
    }

    /// Creates an empty signature rdataset covering `covers`.
    pub fn new_sig(covers: RecordType, ttl: u32) -> Self {
        Self {
            covers,
            ..Self::new(RecordType::SIG, ttl)
        }
    }

    /// Returns true when any of `mask`'s bits are set.
    #[inline]
    pub fn has_attr(&self, mask: u8) -> bool {
        self.attributes & mask != 0
    }

    /// Sets the bits in `mask`.
    #[inline]
    pub fn set_attr(&mut self, mask: u8) {
        self.attributes |= mask;
    }

    /// Returns true for signature rdatasets.
    #[inline]
    pub fn is_sig(&self) -> bool {
        self.rtype == RecordType::SIG
    }

    /// The type this rdataset provides evidence about: the covered type
    /// for signatures, the record type otherwise.
    #[inline]
    pub fn effective_type(&self) -> RecordType {
        if self.is_sig() {
            self.covers
        } else {
            self.rtype
        }
    }

    /// Returns the first rdata, if any.
    #[inline]
    pub fn first(&self) -> Option<&RData> {
        self.rdatas.first()
    }

    /// Folds a record's TTL into the set minimum.
    pub fn absorb_ttl(&mut self, ttl: u32) {
        self.ttl = self.ttl.min(ttl);
    }

    /// Owner names whose address records would complete this rdataset.
    pub fn additional_names(&self) -> impl Iterator<Item = &Name> {
        self.rdatas.iter().filter_map(RData::additional_name)
    }
}

impl fmt::Display for Rrset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdata) in self.rdatas.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{} {} {}", self.ttl, self.rtype, rdata)?;
        }
        Ok(())
    }
}

/// All rdatasets sharing one owner name within a message section.
#[derive(Debug, Clone)]
pub struct OwnerEntry {
    /// The owner name.
    pub name: Name,
    /// Name-level classification marks ([`OwnerEntry::CACHE`] and friends).
    pub attributes: u8,
    /// The rdatasets at this owner.
    pub rrsets: Vec<Rrset>,
}

impl OwnerEntry {
    /// Some rdataset under this name is cacheable.
    pub const CACHE: u8 = 0x01;
    /// This name owns the answer.
    pub const ANSWER: u8 = 0x02;
    /// This name owns negative-cache evidence.
    pub const NCACHE: u8 = 0x04;

    /// Creates an entry with no rdatasets.
    pub fn new(name: Name) -> Self {
        Self {
            name,
            attributes: 0,
            rrsets: Vec::new(),
        }
    }

    /// Returns true when any of `mask`'s bits are set.
    #[inline]
    pub fn has_attr(&self, mask: u8) -> bool {
        self.attributes & mask != 0
    }

    /// Sets the bits in `mask`.
    #[inline]
    pub fn set_attr(&mut self, mask: u8) {
        self.attributes |= mask;
    }

    /// Clears the bits in `mask`.
    #[inline]
    pub fn clear_attr(&mut self, mask: u8) {
        self.attributes &= !mask;
    }

    /// Finds the rdataset with the given type and covers.
    pub fn find(&self, rtype: RecordType, covers: RecordType) -> Option<&Rrset> {
        self.rrsets
            .iter()
            .find(|r| r.rtype == rtype && r.covers == covers)
    }

    /// Mutable variant of [`OwnerEntry::find`].
    pub fn find_mut(&mut self, rtype: RecordType, covers: RecordType) -> Option<&mut Rrset> {
        self.rrsets
            .iter_mut()
            .find(|r| r.rtype == rtype && r.covers == covers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_is_totally_ordered() {
        assert!(Trust::Additional < Trust::Glue);
        assert!(Trust::Glue < Trust::Answer);
        assert!(Trust::Answer < Trust::AuthAuthority);
        assert!(Trust::AuthAuthority < Trust::AuthAnswer);
    }

    #[test]
    fn attribute_marks() {
        let mut rrset = Rrset::new(RecordType::A, 300);
        assert!(!rrset.has_attr(Rrset::CACHE));
        rrset.set_attr(Rrset::CACHE | Rrset::ANSWER);
        assert!(rrset.has_attr(Rrset::CACHE));
        assert!(rrset.has_attr(Rrset::ANSWER));
        assert!(!rrset.has_attr(Rrset::EXTERNAL));
    }

    #[test]
    fn sig_effective_type() {
        let sig = Rrset::new_sig(RecordType::CNAME, 60);
        assert!(sig.is_sig());
        assert_eq!(sig.effective_type(), RecordType::CNAME);
        assert_eq!(Rrset::new(RecordType::NS, 60).effective_type(), RecordType::NS);
    }
}
