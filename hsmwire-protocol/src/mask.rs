//! Redaction of sensitive fields in logged frames.
//!
//! Masking only ever touches the human-readable rendering of a frame, never
//! the bytes that go on the wire. The rendering keeps one character per byte
//! (printable ASCII as-is, anything else as `.`), so a masked rendering always
//! has the same length as the raw frame.

use crate::layout::Layout;
use crate::value::Fields;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fields whose values must not appear in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskRules {
    pub fields: HashSet<String>,
    pub mask_char: char,
}

impl Default for MaskRules {
    fn default() -> Self {
        Self {
            fields: HashSet::new(),
            mask_char: '*',
        }
    }
}

impl MaskRules {
    pub fn new(fields: impl IntoIterator<Item = String>, mask_char: char) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            mask_char,
        }
    }

    pub fn is_masked(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    fn mask_byte(&self) -> u8 {
        if self.mask_char.is_ascii() {
            self.mask_char as u8
        } else {
            b'*'
        }
    }
}

/// Renders `raw` for logging with sensitive fields replaced.
///
/// `body_offset` is where the first field of `layout` starts. Fields are
/// placed at their compiled widths in layout order; a rest-of-body field
/// runs to the end of the frame. Optional fields absent from `fields` were
/// not sent and take no space. Binary and zero-padded fields are always
/// replaced; other fields only when listed in `rules`.
pub fn mask(
    raw: &[u8],
    body_offset: usize,
    fields: &Fields,
    layout: &Layout,
    rules: &MaskRules,
) -> String {
    let mut rendered = render(raw);
    let mask_byte = rules.mask_byte();
    let mut cursor = body_offset.min(rendered.len());

    for field in layout.fields() {
        if cursor == rendered.len() {
            break;
        }
        if field.optional && !fields.contains_key(&field.name) {
            continue;
        }
        let end = field
            .byte_width()
            .map_or(rendered.len(), |w| (cursor + w).min(rendered.len()));
        if field.is_opaque() || rules.is_masked(&field.name) {
            rendered[cursor..end].fill(mask_byte);
        }
        cursor = end;
    }

    rendered.make_ascii_uppercase();
    String::from_utf8_lossy(&rendered).into_owned()
}

fn render(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b
            } else {
                b'.'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{fields, FieldValue};
    use proptest::prelude::*;

    fn layout() -> Layout {
        Layout::parse_expr("key:64/string, pin:32/zstring, mac:32/binary, kcv:48/hex, tail:*/string")
            .unwrap()
    }

    fn frame(values: &Fields) -> Vec<u8> {
        let mut raw = b"0001A100".to_vec();
        raw.extend_from_slice(&layout().build(values).unwrap());
        raw
    }

    fn values() -> Fields {
        fields([
            ("key", FieldValue::from("ABCDEFGH")),
            ("pin", FieldValue::from("12")),
            ("mac", FieldValue::from(vec![0x41u8, 0x42, 0x00, 0xFF])),
            ("kcv", FieldValue::from("414243444546")),
            ("tail", FieldValue::from("ok")),
        ])
    }

    #[test]
    fn test_masks_listed_and_opaque_fields() {
        let values = values();
        let raw = frame(&values);
        let rules = MaskRules::new(vec!["key".to_string(), "kcv".to_string()], '*');

        let out = mask(&raw, 8, &values, &layout(), &rules);
        assert_eq!(out.len(), raw.len());
        assert_eq!(out, format!("0001A100{}OK", "*".repeat(22)));
    }

    #[test]
    fn test_unlisted_text_fields_are_rendered() {
        let values = values();
        let raw = frame(&values);

        let out = mask(&raw, 8, &values, &layout(), &MaskRules::default());
        // Zero-padded and binary fields are never rendered.
        assert_eq!(out, "0001A100ABCDEFGH********ABCDEFOK");
    }

    #[test]
    fn test_header_is_not_masked() {
        let layout = Layout::parse_expr("code:16/string").unwrap();
        let values = fields([("code", "00")]);
        let rules = MaskRules::new(vec!["code".to_string()], '#');

        let out = mask(b"0000A100", 6, &values, &layout, &rules);
        assert_eq!(out, "0000A1##");
    }

    #[test]
    fn test_unmatched_rules_are_skipped() {
        let layout = Layout::parse_expr("key:32/string, tag:16/string").unwrap();
        let values = fields([("key", "abcd"), ("tag", "xy")]);
        let rules = MaskRules::new(vec!["key".to_string(), "other".to_string()], '*');

        let out = mask(b"0001A1abcdxy", 6, &values, &layout, &rules);
        assert_eq!(out, "0001A1****XY");
    }

    #[test]
    fn test_value_repeating_status_digits_is_fully_masked() {
        let layout = Layout::parse_expr("pin:32/string").unwrap();
        let values = fields([("pin", "0000"), ("error_code", "00")]);
        let rules = MaskRules::new(vec!["pin".to_string()], '*');

        // Body starts after the two-character status.
        let out = mask(b"0001V1000000", 8, &values, &layout, &rules);
        assert_eq!(out, "0001V100****");
    }

    #[test]
    fn test_absent_optional_fields_take_no_space() {
        let layout = Layout::parse_expr("mode:8/string, lmk_id:16/numeric?, tail:*/string?").unwrap();
        let values = fields([("mode", FieldValue::from("0")), ("tail", FieldValue::from("zz"))]);
        let rules = MaskRules::new(vec!["lmk_id".to_string(), "tail".to_string()], '*');

        let out = mask(b"0001A00zz", 6, &values, &layout, &rules);
        assert_eq!(out, "0001A00**");
    }

    #[test]
    fn test_short_frame_is_clamped() {
        let layout = Layout::parse_expr("key:64/string, pin:32/zstring").unwrap();
        let values = fields([("key", "ABCDEFGH"), ("pin", "12")]);
        let rules = MaskRules::new(vec!["key".to_string()], '*');

        let out = mask(b"0001A1ABC", 6, &values, &layout, &rules);
        assert_eq!(out, "0001A1***");
    }

    #[test]
    fn test_non_ascii_mask_char_falls_back() {
        let layout = Layout::parse_expr("key:16/string").unwrap();
        let values = fields([("key", "AB")]);
        let rules = MaskRules::new(vec!["key".to_string()], 'é');

        assert_eq!(mask(b"00AB", 2, &values, &layout, &rules), "00**");
    }

    proptest! {
        #[test]
        fn prop_mask_preserves_length(
            key in "[ -~]{8}",
            pin in "[0-9]{0,4}",
            mac in proptest::collection::vec(any::<u8>(), 4),
            kcv in proptest::collection::vec(any::<u8>(), 6),
            tail in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let values = fields([
                ("key", FieldValue::from(key)),
                ("pin", FieldValue::from(pin)),
                ("mac", FieldValue::from(mac)),
                ("kcv", FieldValue::from(hex::encode_upper(kcv))),
            ]);
            let mut raw = b"0001A100".to_vec();
            let fixed = Layout::parse_expr("key:64/string, pin:32/zstring, mac:32/binary, kcv:48/hex").unwrap();
            raw.extend_from_slice(&fixed.build(&values).unwrap());
            raw.extend_from_slice(&tail);

            let rules = MaskRules::new(vec!["key".to_string()], '*');
            let out = mask(&raw, 8, &values, &fixed, &rules);
            prop_assert_eq!(out.len(), raw.len());
            prop_assert_eq!(&out[8..24], "*".repeat(16));
        }
    }
}
