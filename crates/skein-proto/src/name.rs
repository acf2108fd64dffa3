//! DNS domain name representation and operations.
//!
//! Names are stored in uncompressed wire form (length-prefixed labels
//! terminated by the root label). Comparison, hashing, and subdomain tests
//! are case-insensitive per RFC 1035. Small names stay inline.

use crate::error::{Error, Result};
use crate::wire::WireReader;
use bytes::BytesMut;
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Maximum wire-form length of a name, including the root label.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length of a single label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Cap on compression pointer jumps while parsing one name.
const MAX_POINTER_JUMPS: usize = 32;

/// A DNS domain name in uncompressed wire form.
#[derive(Clone)]
pub struct Name {
    wire: SmallVec<[u8; 64]>,
}

impl Name {
    /// Returns the root name (`.`).
    pub fn root() -> Self {
        let mut wire = SmallVec::new();
        wire.push(0);
        Self { wire }
    }

    /// Builds a name from uncompressed wire bytes, validating structure.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_NAME_LENGTH {
            return Err(Error::NameTooLong(bytes.len()));
        }
        let mut pos = 0;
        loop {
            let len = *bytes
                .get(pos)
                .ok_or(Error::UnexpectedEnd { offset: pos })? as usize;
            if len == 0 {
                if pos + 1 != bytes.len() {
                    return Err(Error::FormErr {
                        reason: "trailing bytes after root label",
                    });
                }
                break;
            }
            if len > MAX_LABEL_LENGTH {
                return Err(Error::LabelTooLong(len));
            }
            pos += 1 + len;
        }
        Ok(Self {
            wire: SmallVec::from_slice(bytes),
        })
    }

    /// Parses a (possibly compressed) name from the reader.
    ///
    /// The reader's position is left just past the name's first encoding;
    /// compression pointers are chased within the reader's full buffer.
    pub fn parse(reader: &mut WireReader<'_>) -> Result<Self> {
        let data = reader.data();
        let mut pos = reader.position();
        let mut wire: SmallVec<[u8; 64]> = SmallVec::new();
        let mut end_pos = None;
        let mut jumps = 0;

        loop {
            let len = *data.get(pos).ok_or(Error::UnexpectedEnd { offset: pos })?;
            match len & 0xc0 {
                0xc0 => {
                    let lo = *data
                        .get(pos + 1)
                        .ok_or(Error::UnexpectedEnd { offset: pos + 1 })?;
                    if end_pos.is_none() {
                        end_pos = Some(pos + 2);
                    }
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(Error::TooManyJumps);
                    }
                    let target = (((len & 0x3f) as usize) << 8) | lo as usize;
                    if target >= data.len() {
                        return Err(Error::BadPointer(pos));
                    }
                    pos = target;
                }
                0x00 => {
                    if len == 0 {
                        wire.push(0);
                        if end_pos.is_none() {
                            end_pos = Some(pos + 1);
                        }
                        break;
                    }
                    let start = pos + 1;
                    let end = start + len as usize;
                    let label = data
                        .get(start..end)
                        .ok_or(Error::UnexpectedEnd { offset: end })?;
                    if wire.len() + 1 + len as usize + 1 > MAX_NAME_LENGTH {
                        return Err(Error::NameTooLong(wire.len() + 2 + len as usize));
                    }
                    wire.push(len);
                    wire.extend_from_slice(label);
                    pos = end;
                }
                _ => return Err(Error::BadPointer(pos)),
            }
        }

        // end_pos is set on every loop exit path.
        if let Some(end) = end_pos {
            reader.set_position(end);
        }
        Ok(Self { wire })
    }

    /// Appends the uncompressed wire form to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.wire);
    }

    /// Returns the wire-form length, including the root label.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// Returns the raw wire bytes.
    #[inline]
    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    /// Returns true for the root name.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// Returns the number of labels, excluding the root.
    pub fn label_count(&self) -> usize {
        self.labels().count()
    }

    /// Iterates over the labels, most-specific first, excluding the root.
    pub fn labels(&self) -> Labels<'_> {
        Labels {
            data: &self.wire,
            pos: 0,
        }
    }

    /// Returns the name with its leading label removed, or `None` for root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let skip = 1 + self.wire[0] as usize;
        Some(Self {
            wire: SmallVec::from_slice(&self.wire[skip..]),
        })
    }

    /// Returns true if `self` is `other` or a subdomain of it.
    pub fn is_subdomain_of(&self, other: &Self) -> bool {
        let ours: Vec<&[u8]> = self.labels().collect();
        let theirs: Vec<&[u8]> = other.labels().collect();
        if theirs.len() > ours.len() {
            return false;
        }
        ours[ours.len() - theirs.len()..]
            .iter()
            .zip(theirs.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Replaces the suffix `owner` of this name with `target`.
    ///
    /// This is DNAME substitution: `self` must be a strict subdomain of
    /// `owner`. Returns [`Error::NoSpace`] when the synthesized name would
    /// exceed the wire-form limit, and [`Error::FormErr`] when `self` is
    /// not beneath `owner`.
    pub fn rebase(&self, owner: &Self, target: &Self) -> Result<Self> {
        if !self.is_subdomain_of(owner) || self.label_count() == owner.label_count() {
            return Err(Error::FormErr {
                reason: "name is not beneath the substitution owner",
            });
        }
        let keep = self.label_count() - owner.label_count();
        let mut prefix_len = 0;
        for label in self.labels().take(keep) {
            prefix_len += 1 + label.len();
        }
        let total = prefix_len + target.wire_len();
        if total > MAX_NAME_LENGTH {
            return Err(Error::NoSpace(total));
        }
        let mut wire: SmallVec<[u8; 64]> = SmallVec::from_slice(&self.wire[..prefix_len]);
        wire.extend_from_slice(&target.wire);
        Ok(Self { wire })
    }
}

/// Iterator over a name's labels.
pub struct Labels<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let len = *self.data.get(self.pos)? as usize;
        if len == 0 {
            return None;
        }
        let start = self.pos + 1;
        let label = self.data.get(start..start + len)?;
        self.pos = start + len;
        Some(label)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        if self.wire.len() != other.wire.len() {
            return false;
        }
        self.labels()
            .zip(other.labels())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in self.labels() {
            state.write_u8(label.len() as u8);
            for &b in label {
                state.write_u8(b.to_ascii_lowercase());
            }
        }
        state.write_u8(0);
    }
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::BadNameText("empty name".into()));
        }
        if s == "." {
            return Ok(Self::root());
        }
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        let mut wire: SmallVec<[u8; 64]> = SmallVec::new();
        for label in trimmed.split('.') {
            if label.is_empty() {
                return Err(Error::BadNameText(format!("empty label in {s:?}")));
            }
            if label.len() > MAX_LABEL_LENGTH {
                return Err(Error::LabelTooLong(label.len()));
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);
        if wire.len() > MAX_NAME_LENGTH {
            return Err(Error::NameTooLong(wire.len()));
        }
        Ok(Self { wire })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels() {
            for &b in label {
                if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{b:03}")?;
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}
