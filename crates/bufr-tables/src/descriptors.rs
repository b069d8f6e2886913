//! Typed descriptor entities.
//!
//! A descriptor id is a six-digit number `FXXYYY`. The leading digit `F`
//! selects the kind: 0 element, 1 replication, 2 operator, 3 sequence.
//! Replication and sequence descriptors own their member descriptors once a
//! template has been built, so walking a template never goes back to the
//! tables.

use std::fmt;
use std::sync::Arc;

/// Units string marking a CCITT IA5 (character) element.
pub const UNITS_STRING: &str = "CCITT IA5";
/// Units string marking a code-table element.
pub const UNITS_CODE_TABLE: &str = "CODE TABLE";
/// Units string marking a flag-table element.
pub const UNITS_FLAG_TABLE: &str = "FLAG TABLE";

/// Splits a descriptor id into its `(F, X, Y)` digits.
#[inline]
pub fn fxy(id: u32) -> (u8, u8, u16) {
    ((id / 100_000) as u8, (id / 1000 % 100) as u8, (id % 1000) as u16)
}

/// How the value of an element descriptor is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Numeric,
    CodeTable,
    FlagTable,
    String,
}

/// A Table B element descriptor: a single quantity with packing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDescriptor {
    pub id: u32,
    pub name: String,
    pub unit: String,
    pub scale: i32,
    pub refval: i64,
    pub nbits: usize,
}

impl ElementDescriptor {
    /// The class digits `XX` of the id.
    #[inline]
    pub fn class(&self) -> u8 {
        fxy(self.id).1
    }

    /// The value interpretation implied by the units string.
    pub fn kind(&self) -> ElementKind {
        match self.unit.as_str() {
            UNITS_STRING => ElementKind::String,
            UNITS_CODE_TABLE => ElementKind::CodeTable,
            UNITS_FLAG_TABLE => ElementKind::FlagTable,
            _ => ElementKind::Numeric,
        }
    }
}

impl fmt::Display for ElementDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.id)
    }
}

/// A Table C operator descriptor `2XXYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorDescriptor {
    pub id: u32,
}

impl OperatorDescriptor {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    /// The operator code `2XX`.
    #[inline]
    pub fn operator_code(&self) -> u32 {
        self.id / 1000
    }

    /// The operand `YYY`.
    #[inline]
    pub fn operand(&self) -> u32 {
        self.id % 1000
    }
}

impl fmt::Display for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.id)
    }
}

/// A Table D sequence descriptor with its expanded members.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDescriptor {
    pub id: u32,
    pub name: String,
    pub members: Vec<Descriptor>,
}

impl fmt::Display for SequenceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.id)
    }
}

/// A descriptor as it appears in a built template.
///
/// Replications carry their member group; delayed replications additionally
/// carry the class 31 factor element whose decoded value drives the repeat
/// count.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Element(Arc<ElementDescriptor>),
    FixedReplication {
        id: u32,
        members: Vec<Descriptor>,
    },
    DelayedReplication {
        id: u32,
        factor: Arc<ElementDescriptor>,
        members: Vec<Descriptor>,
    },
    Operator(OperatorDescriptor),
    Sequence(Arc<SequenceDescriptor>),
    /// An element id absent from Table B. Legal in a template as long as a
    /// preceding 206YYY skips it; walking it directly is an error.
    Undefined { id: u32 },
}

impl Descriptor {
    pub fn id(&self) -> u32 {
        match self {
            Descriptor::Element(e) => e.id,
            Descriptor::FixedReplication { id, .. } => *id,
            Descriptor::DelayedReplication { id, .. } => *id,
            Descriptor::Operator(o) => o.id,
            Descriptor::Sequence(s) => s.id,
            Descriptor::Undefined { id } => *id,
        }
    }

    /// Number of repeats of a fixed replication (`YYY`).
    pub fn n_repeats(&self) -> usize {
        (self.id() % 1000) as usize
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.id())
    }
}

/// A built BUFR template: the expanded form of section 3's descriptor list.
#[derive(Debug, Clone, PartialEq)]
pub struct BufrTemplate {
    pub members: Vec<Descriptor>,
}

impl BufrTemplate {
    pub fn new(members: Vec<Descriptor>) -> Self {
        Self { members }
    }

    /// The flat list of raw ids this template was built from, in section 3
    /// order (replication factors re-inserted after their replication id).
    pub fn flat_ids(&self) -> Vec<u32> {
        fn push(out: &mut Vec<u32>, members: &[Descriptor]) {
            for member in members {
                match member {
                    Descriptor::Sequence(s) => out.push(s.id),
                    Descriptor::FixedReplication { id, members } => {
                        out.push(*id);
                        push(out, members);
                    }
                    Descriptor::DelayedReplication { id, factor, members } => {
                        out.push(*id);
                        out.push(factor.id);
                        push(out, members);
                    }
                    other => out.push(other.id()),
                }
            }
        }
        let mut out = Vec::new();
        push(&mut out, &self.members);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fxy_split() {
        assert_eq!(fxy(1001), (0, 1, 1));
        assert_eq!(fxy(103000), (1, 3, 0));
        assert_eq!(fxy(204008), (2, 4, 8));
        assert_eq!(fxy(301001), (3, 1, 1));
    }

    #[test]
    fn test_operator_parts() {
        let op = OperatorDescriptor::new(201132);
        assert_eq!(op.operator_code(), 201);
        assert_eq!(op.operand(), 132);
    }

    #[test]
    fn test_element_kind_from_unit() {
        let mut e = ElementDescriptor {
            id: 1015,
            name: "STATION NAME".into(),
            unit: UNITS_STRING.into(),
            scale: 0,
            refval: 0,
            nbits: 160,
        };
        assert_eq!(e.kind(), ElementKind::String);
        e.unit = "K".into();
        assert_eq!(e.kind(), ElementKind::Numeric);
        e.unit = UNITS_FLAG_TABLE.into();
        assert_eq!(e.kind(), ElementKind::FlagTable);
    }
}
