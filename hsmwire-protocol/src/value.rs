//! Field values exchanged between callers and the codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named field values of one message body.
pub type Fields = BTreeMap<String, FieldValue>;

/// A single decoded (or to-be-encoded) field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Unsigned decimal value of a numeric field.
    Number(u64),
    /// Text of a string field (or hex text of a hex field).
    Text(String),
    /// Raw bytes of a binary field.
    Binary(Bytes),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<Bytes> for FieldValue {
    fn from(b: Bytes) -> Self {
        FieldValue::Binary(b)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Binary(Bytes::from(b))
    }
}

/// Builds a [`Fields`] map from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FieldValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(FieldValue::from("U").as_text(), Some("U"));
        assert_eq!(FieldValue::from(7u64).as_number(), Some(7));
        assert_eq!(
            FieldValue::from(vec![1u8, 2]).as_bytes(),
            Some(&[1u8, 2][..])
        );
        assert!(FieldValue::from(7u64).as_text().is_none());
    }

    #[test]
    fn test_display_hides_binary_content() {
        let value = FieldValue::from(vec![0xAAu8; 16]);
        assert_eq!(value.to_string(), "<16 bytes>");
    }

    #[test]
    fn test_fields_builder() {
        let f = fields([("mode", "0"), ("key_type", "000")]);
        assert_eq!(f.len(), 2);
        assert_eq!(f["mode"], FieldValue::Text("0".into()));
    }
}
