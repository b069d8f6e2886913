//! Decoded value representation.

use std::fmt;

/// One decoded slot of a data node.
///
/// `Missing` stands for the BUFR missing value, the all-ones raw pattern at
/// the element's effective width. Character fields decode to `Str` when the
/// octets are valid UTF-8 (CCITT IA5 is a subset) and to `Bytes` otherwise;
/// both re-encode to the exact original octets.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[inline]
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// The value as an integer, when it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Builds a string value from raw octets, keeping them as bytes when
    /// they are not valid UTF-8.
    pub fn from_octets(octets: Vec<u8>) -> Value {
        match String::from_utf8(octets) {
            Ok(s) => Value::Str(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        }
    }

    /// The octets of a string-typed value.
    pub fn octets(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// A short name of the variant for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "None"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{b:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_octets_utf8() {
        assert_eq!(Value::from_octets(b"UKMS ".to_vec()), Value::Str("UKMS ".into()));
    }

    #[test]
    fn test_from_octets_binary() {
        let v = Value::from_octets(vec![0xff, 0xff]);
        assert_eq!(v, Value::Bytes(vec![0xff, 0xff]));
        assert_eq!(v.octets(), Some(&[0xff, 0xff][..]));
    }
}
