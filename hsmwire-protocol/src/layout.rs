//! Field layouts and their compact declaration syntax.
//!
//! A layout is an ordered list of fields with explicit bit widths:
//!
//! ```text
//! mode:8/string, key_type:24/string, key:264/string, lmk_delimiter:8/string?, lmk_id:16/numeric?
//! ```
//!
//! Each entry is `name:width/encoding`, with an optional trailing `?` for
//! optional fields. The width is a bit count (a multiple of 8) or `*` for
//! "the rest of the body". Encodings:
//!
//! - `string` - ASCII text of exactly `width / 8` bytes
//! - `zstring` - ASCII text right-padded with NUL bytes
//! - `binary` - raw bytes
//! - `hex` - raw bytes on the wire, upper-case hex text for callers
//! - `numeric` - ASCII decimal digits, zero-left-padded
//!
//! Layouts are compiled once; the compiled form parses bodies into [`Fields`]
//! and builds bodies from them.

use crate::error::LayoutError;
use crate::value::{FieldValue, Fields};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Largest numeric field, in digits, that fits a `u64`.
pub const MAX_NUMERIC_DIGITS: usize = 20;

/// Wire encoding of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    String,
    ZeroPaddedString,
    Binary,
    Numeric,
}

/// Declaration of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Width in bits; `None` consumes the rest of the body.
    #[serde(default)]
    pub width: Option<u32>,
    pub encoding: Encoding,
    /// Binary field exchanged with callers as hex text.
    #[serde(default)]
    pub binary_as_hex: bool,
    #[serde(default)]
    pub optional: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, width: Option<u32>, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            width,
            encoding,
            binary_as_hex: false,
            optional: false,
        }
    }

    pub fn hex(mut self) -> Self {
        self.binary_as_hex = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Width in bytes, or `None` for a rest-of-body field.
    pub fn byte_width(&self) -> Option<usize> {
        self.width.map(|bits| bits as usize / 8)
    }

    /// Whether values of this field are never rendered in logs.
    pub fn is_opaque(&self) -> bool {
        matches!(
            self.encoding,
            Encoding::Binary | Encoding::ZeroPaddedString
        ) && !self.binary_as_hex
    }

    /// Appends the wire form of `value` to `out`.
    pub fn encode_value(&self, value: &FieldValue, out: &mut BytesMut) -> Result<(), LayoutError> {
        let width = self.byte_width();
        match self.encoding {
            Encoding::String => {
                let text = self.text_of(value)?;
                self.check_ascii(&text)?;
                if let Some(w) = width {
                    if text.len() != w {
                        return Err(self.invalid(format!(
                            "expected {} characters, got {}",
                            w,
                            text.len()
                        )));
                    }
                }
                out.put_slice(text.as_bytes());
            }
            Encoding::ZeroPaddedString => {
                let text = self.text_of(value)?;
                self.check_ascii(&text)?;
                out.put_slice(text.as_bytes());
                if let Some(w) = width {
                    if text.len() > w {
                        return Err(self.invalid(format!(
                            "at most {} characters allowed, got {}",
                            w,
                            text.len()
                        )));
                    }
                    out.put_bytes(0, w - text.len());
                }
            }
            Encoding::Binary => {
                let bytes = match value {
                    FieldValue::Binary(b) => b.clone(),
                    FieldValue::Text(s) if self.binary_as_hex => Bytes::from(
                        hex::decode(s).map_err(|e| self.invalid(format!("bad hex: {}", e)))?,
                    ),
                    _ => return Err(self.invalid("expected binary value".to_string())),
                };
                if let Some(w) = width {
                    if bytes.len() != w {
                        return Err(self.invalid(format!(
                            "expected {} bytes, got {}",
                            w,
                            bytes.len()
                        )));
                    }
                }
                out.put_slice(&bytes);
            }
            Encoding::Numeric => {
                let digits = match value {
                    FieldValue::Number(n) => n.to_string(),
                    FieldValue::Text(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                        s.trim_start_matches('0').to_string()
                    }
                    _ => return Err(self.invalid("expected decimal digits".to_string())),
                };
                match width {
                    Some(w) => {
                        if digits.len() > w {
                            return Err(self.invalid(format!("does not fit in {} digits", w)));
                        }
                        out.put_bytes(b'0', w - digits.len());
                        out.put_slice(digits.as_bytes());
                    }
                    None if digits.is_empty() => out.put_u8(b'0'),
                    None => out.put_slice(digits.as_bytes()),
                }
            }
        }
        Ok(())
    }

    /// Decodes the wire bytes of this field.
    pub fn decode_value(&self, raw: &[u8]) -> Result<FieldValue, LayoutError> {
        match self.encoding {
            Encoding::String => Ok(FieldValue::Text(self.ascii_text(raw)?)),
            Encoding::ZeroPaddedString => {
                let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                Ok(FieldValue::Text(self.ascii_text(&raw[..end])?))
            }
            Encoding::Binary if self.binary_as_hex => Ok(FieldValue::Text(hex::encode_upper(raw))),
            Encoding::Binary => Ok(FieldValue::Binary(Bytes::copy_from_slice(raw))),
            Encoding::Numeric => {
                if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
                    return Err(self.invalid("expected decimal digits".to_string()));
                }
                let text = self.ascii_text(raw)?;
                text.parse::<u64>()
                    .map(FieldValue::Number)
                    .map_err(|e| self.invalid(e.to_string()))
            }
        }
    }

    /// Returns `value` in the form `decode_value` produces for it.
    ///
    /// Digit text in a numeric field becomes a number, numbers in text
    /// fields become text and hex text is upper-cased. Anything else is
    /// returned unchanged.
    pub fn normalize_value(&self, value: &FieldValue) -> FieldValue {
        match (self.encoding, value) {
            (Encoding::Numeric, FieldValue::Text(s))
                if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) =>
            {
                s.parse().map_or_else(|_| value.clone(), FieldValue::Number)
            }
            (Encoding::String | Encoding::ZeroPaddedString, FieldValue::Number(n)) => {
                FieldValue::Text(n.to_string())
            }
            (Encoding::Binary, FieldValue::Text(s)) if self.binary_as_hex => {
                FieldValue::Text(s.to_ascii_uppercase())
            }
            _ => value.clone(),
        }
    }

    fn text_of(&self, value: &FieldValue) -> Result<String, LayoutError> {
        match value {
            FieldValue::Text(s) => Ok(s.clone()),
            FieldValue::Number(n) => Ok(n.to_string()),
            FieldValue::Binary(_) => Err(self.invalid("expected text value".to_string())),
        }
    }

    fn check_ascii(&self, text: &str) -> Result<(), LayoutError> {
        if text.is_ascii() {
            Ok(())
        } else {
            Err(self.invalid("non-ASCII text".to_string()))
        }
    }

    fn ascii_text(&self, raw: &[u8]) -> Result<String, LayoutError> {
        if !raw.is_ascii() {
            return Err(self.invalid("non-ASCII bytes".to_string()));
        }
        // ASCII is always valid UTF-8.
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn invalid(&self, reason: String) -> LayoutError {
        LayoutError::InvalidValue {
            field: self.name.clone(),
            reason,
        }
    }
}

/// Layout as written in a catalog: compact expression or explicit field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayoutSource {
    Expr(String),
    Fields(Vec<FieldSpec>),
}

impl From<&str> for LayoutSource {
    fn from(s: &str) -> Self {
        LayoutSource::Expr(s.to_string())
    }
}

/// A validated layout, ready to parse and build bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<FieldSpec>,
}

impl Layout {
    /// Compiles a layout from its catalog form.
    pub fn compile(source: &LayoutSource) -> Result<Self, LayoutError> {
        let fields = match source {
            LayoutSource::Expr(expr) => Parser::new(expr).parse_layout()?,
            LayoutSource::Fields(fields) => fields.clone(),
        };
        Self::from_fields(fields)
    }

    /// Compiles a layout from the compact expression syntax.
    pub fn parse_expr(expr: &str) -> Result<Self, LayoutError> {
        Self::from_fields(Parser::new(expr).parse_layout()?)
    }

    /// Validates an explicit field list.
    pub fn from_fields(fields: Vec<FieldSpec>) -> Result<Self, LayoutError> {
        let mut names = HashSet::new();
        let mut seen_optional = false;
        let count = fields.len();

        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(LayoutError::Invalid(format!("field {} has no name", i)));
            }
            if !names.insert(field.name.as_str()) {
                return Err(LayoutError::Invalid(format!(
                    "duplicate field '{}'",
                    field.name
                )));
            }
            match field.width {
                Some(bits) if bits == 0 || bits % 8 != 0 => {
                    return Err(LayoutError::Invalid(format!(
                        "field '{}' width {} is not a positive multiple of 8",
                        field.name, bits
                    )));
                }
                None if i + 1 != count => {
                    return Err(LayoutError::Invalid(format!(
                        "rest-of-body field '{}' must be last",
                        field.name
                    )));
                }
                _ => {}
            }
            if field.encoding == Encoding::Numeric
                && field.byte_width().is_some_and(|w| w > MAX_NUMERIC_DIGITS)
            {
                return Err(LayoutError::Invalid(format!(
                    "numeric field '{}' wider than {} digits",
                    field.name, MAX_NUMERIC_DIGITS
                )));
            }
            if field.binary_as_hex && field.encoding != Encoding::Binary {
                return Err(LayoutError::Invalid(format!(
                    "field '{}' is hex but not binary",
                    field.name
                )));
            }
            if seen_optional && !field.optional {
                return Err(LayoutError::Invalid(format!(
                    "required field '{}' follows an optional field",
                    field.name
                )));
            }
            seen_optional |= field.optional;
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses a complete body. Every byte must be consumed.
    pub fn parse(&self, body: &[u8]) -> Result<Fields, LayoutError> {
        let mut out = Fields::new();
        let mut pos = 0;

        for field in &self.fields {
            let available = body.len() - pos;
            if field.optional && available == 0 {
                continue;
            }
            let needed = field.byte_width().unwrap_or(available);
            if available < needed {
                return Err(LayoutError::Truncated {
                    field: field.name.clone(),
                    needed,
                    available,
                });
            }
            let value = field.decode_value(&body[pos..pos + needed])?;
            out.insert(field.name.clone(), value);
            pos += needed;
        }

        if pos != body.len() {
            return Err(LayoutError::TrailingBytes(body.len() - pos));
        }
        Ok(out)
    }

    /// Builds a body from field values, appending to `out`.
    ///
    /// Fields not named in the layout are ignored.
    pub fn build_into(&self, values: &Fields, out: &mut BytesMut) -> Result<(), LayoutError> {
        for field in &self.fields {
            match values.get(&field.name) {
                Some(value) => field.encode_value(value, out)?,
                None if field.optional => {}
                None => return Err(LayoutError::MissingField(field.name.clone())),
            }
        }
        Ok(())
    }

    /// Builds a body from field values.
    pub fn build(&self, values: &Fields) -> Result<BytesMut, LayoutError> {
        let mut out = BytesMut::new();
        self.build_into(values, &mut out)?;
        Ok(out)
    }

    /// Canonical form of `values` for this layout.
    ///
    /// For any `values` that builds, `parse(build(values)) == normalize(values)`.
    /// Fields not named in the layout are dropped.
    pub fn normalize(&self, values: &Fields) -> Fields {
        self.fields
            .iter()
            .filter_map(|field| {
                values
                    .get(&field.name)
                    .map(|value| (field.name.clone(), field.normalize_value(value)))
            })
            .collect()
    }
}

/// Recursive descent parser for the compact layout syntax.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_layout(&mut self) -> Result<Vec<FieldSpec>, LayoutError> {
        let mut fields = Vec::new();
        self.skip_whitespace();
        if self.at_end() {
            return Ok(fields);
        }

        loop {
            fields.push(self.parse_field()?);
            self.skip_whitespace();
            match self.peek_char() {
                None => break,
                Some(',') => {
                    self.pos += 1;
                    self.skip_whitespace();
                }
                Some(c) => {
                    return Err(self.error(format!("expected ',' but found '{}'", c)));
                }
            }
        }

        Ok(fields)
    }

    fn parse_field(&mut self) -> Result<FieldSpec, LayoutError> {
        let name = self.parse_ident()?;
        self.skip_whitespace();
        self.expect(':')?;
        self.skip_whitespace();
        let width = self.parse_width()?;
        self.skip_whitespace();
        self.expect('/')?;
        self.skip_whitespace();
        let encoding = self.parse_ident()?;
        self.skip_whitespace();
        let optional = if self.peek_char() == Some('?') {
            self.pos += 1;
            true
        } else {
            false
        };

        let (encoding, binary_as_hex) = match encoding.as_str() {
            "string" => (Encoding::String, false),
            "zstring" => (Encoding::ZeroPaddedString, false),
            "binary" => (Encoding::Binary, false),
            "hex" => (Encoding::Binary, true),
            "numeric" => (Encoding::Numeric, false),
            other => return Err(self.error(format!("unknown encoding '{}'", other))),
        };

        Ok(FieldSpec {
            name,
            width,
            encoding,
            binary_as_hex,
            optional,
        })
    }

    fn parse_width(&mut self) -> Result<Option<u32>, LayoutError> {
        if self.peek_char() == Some('*') {
            self.pos += 1;
            return Ok(None);
        }

        let start = self.pos;
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        digits
            .parse::<u32>()
            .map(Some)
            .map_err(|_| self.error(format!("invalid width '{}'", digits)))
    }

    fn parse_ident(&mut self) -> Result<String, LayoutError> {
        let start = self.pos;
        while matches!(self.peek_char(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected identifier".to_string()));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn expect(&mut self, c: char) -> Result<(), LayoutError> {
        if self.peek_char() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn error(&self, reason: String) -> LayoutError {
        LayoutError::Invalid(format!("{} at offset {}", reason, self.pos))
    }
}
