//! Field normalisation applied before encoding.

use crate::value::{FieldValue, Fields};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Injects a delimiter field when a key-scheme identifier is present.
///
/// The HSM selects an alternate LMK when the message ends with a delimiter
/// followed by the LMK identifier. When the identifier is absent or not
/// numeric both fields are dropped so the optional trailer is omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySchemeRule {
    pub id_field: String,
    pub delimiter_field: String,
    pub delimiter: String,
}

impl Default for KeySchemeRule {
    fn default() -> Self {
        Self {
            id_field: "lmk_id".to_string(),
            delimiter_field: "lmk_delimiter".to_string(),
            delimiter: "%".to_string(),
        }
    }
}

impl KeySchemeRule {
    pub fn apply(&self, fields: &mut Fields) {
        let valid = match fields.get(&self.id_field) {
            Some(FieldValue::Number(_)) => true,
            Some(FieldValue::Text(s)) => !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
            _ => false,
        };

        if valid {
            fields.insert(
                self.delimiter_field.clone(),
                FieldValue::Text(self.delimiter.clone()),
            );
        } else {
            fields.remove(&self.id_field);
            fields.remove(&self.delimiter_field);
        }
    }
}

/// Transforms applied to outbound payloads.
#[derive(Debug, Clone, Default)]
pub struct FieldTransforms {
    key_schemes: Vec<KeySchemeRule>,
    non_correctable: HashSet<String>,
}

impl FieldTransforms {
    pub fn new(
        key_schemes: Vec<KeySchemeRule>,
        non_correctable: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            key_schemes,
            non_correctable: non_correctable.into_iter().collect(),
        }
    }

    /// Returns a normalised copy of `fields`.
    pub fn apply(&self, fields: &Fields) -> Fields {
        let mut out = fields.clone();
        for rule in &self.key_schemes {
            rule.apply(&mut out);
        }
        uppercase(&mut out, &self.non_correctable);
        out
    }
}

/// Upper-cases every text field whose name is not in `exempt`.
pub fn uppercase(fields: &mut Fields, exempt: &HashSet<String>) {
    for (name, value) in fields.iter_mut() {
        if exempt.contains(name) {
            continue;
        }
        if let FieldValue::Text(text) = value {
            text.make_ascii_uppercase();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::fields;

    #[test]
    fn test_key_scheme_injects_delimiter() {
        let rule = KeySchemeRule::default();

        let mut f = fields([("mode", "0"), ("lmk_id", "01")]);
        rule.apply(&mut f);
        assert_eq!(f["lmk_delimiter"], FieldValue::from("%"));

        let mut f = fields([("mode", FieldValue::from("0")), ("lmk_id", 3u64.into())]);
        rule.apply(&mut f);
        assert!(f.contains_key("lmk_delimiter"));
    }

    #[test]
    fn test_key_scheme_drops_invalid_identifier() {
        let rule = KeySchemeRule::default();

        let mut f = fields([("mode", "0"), ("lmk_id", "x1"), ("lmk_delimiter", "%")]);
        rule.apply(&mut f);
        assert!(!f.contains_key("lmk_id"));
        assert!(!f.contains_key("lmk_delimiter"));

        let mut f = fields([("mode", "0"), ("lmk_delimiter", "%")]);
        rule.apply(&mut f);
        assert!(!f.contains_key("lmk_delimiter"));
    }

    #[test]
    fn test_uppercase_respects_exemptions() {
        let transforms = FieldTransforms::new(vec![], vec!["data".to_string()]);
        let input = fields([
            ("key_scheme", FieldValue::from("u")),
            ("data", FieldValue::from("mixed Case")),
            ("count", FieldValue::from(5u64)),
        ]);

        let out = transforms.apply(&input);
        assert_eq!(out["key_scheme"], FieldValue::from("U"));
        assert_eq!(out["data"], FieldValue::from("mixed Case"));
        assert_eq!(out["count"], FieldValue::from(5u64));
        // Input is left untouched.
        assert_eq!(input["key_scheme"], FieldValue::from("u"));
    }
}
