//! HSM message frames.
//!
//! A message is a fixed header followed by a command-specific body:
//!
//! ```text
//! +----------------------+--------+-------------------------+
//! | trace                | code   | body                    |
//! | N ASCII digits       | 2 chars| command layout          |
//! +----------------------+--------+-------------------------+
//! ```
//!
//! On a stream each message is preceded by its length as a 2-byte big-endian
//! integer:
//!
//! ```text
//! +-----------+-----------------------------+
//! | length    | message                     |
//! | 2 bytes   | length bytes                |
//! +-----------+-----------------------------+
//! ```

use crate::error::ProtocolError;
use crate::layout::{Encoding, FieldSpec, Layout};
use crate::value::{FieldValue, Fields};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the stream length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest message that fits behind the length prefix.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Width of the command/response code in characters.
pub const CODE_WIDTH: usize = 2;

/// Largest supported trace width (the counter is a `u64`).
pub const MAX_TRACE_WIDTH: usize = 18;

/// A parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Zero-padded trace number.
    pub trace: String,
    /// Two-character command or response code.
    pub code: String,
    pub body: Bytes,
}

/// The header layout of one deployment: `trace` digits then the code.
#[derive(Debug, Clone)]
pub struct HeaderLayout {
    trace_width: usize,
    layout: Layout,
}

impl HeaderLayout {
    pub fn new(trace_width: usize) -> Result<Self, ProtocolError> {
        if trace_width == 0 || trace_width > MAX_TRACE_WIDTH {
            return Err(ProtocolError::Configuration {
                command: "header".to_string(),
                reason: format!(
                    "trace width must be between 1 and {}, got {}",
                    MAX_TRACE_WIDTH, trace_width
                ),
            });
        }
        let layout = Layout::from_fields(vec![
            FieldSpec::new("trace", Some(trace_width as u32 * 8), Encoding::String),
            FieldSpec::new("code", Some(CODE_WIDTH as u32 * 8), Encoding::String),
            FieldSpec::new("body", None, Encoding::Binary),
        ])
        .map_err(|e| ProtocolError::Configuration {
            command: "header".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            trace_width,
            layout,
        })
    }

    pub fn trace_width(&self) -> usize {
        self.trace_width
    }

    /// Offset of the body within a message.
    pub fn body_offset(&self) -> usize {
        self.trace_width + CODE_WIDTH
    }

    /// Largest trace number representable in the configured width.
    pub fn max_trace(&self) -> u64 {
        10u64.pow(self.trace_width as u32) - 1
    }

    /// Zero-pads a trace number to the header width.
    pub fn format_trace(&self, trace: u64) -> String {
        format!("{:0width$}", trace, width = self.trace_width)
    }

    /// Splits a message into its header fields and body.
    pub fn parse(&self, raw: &[u8]) -> Result<Frame, ProtocolError> {
        let mut parsed = self
            .layout
            .parse(raw)
            .map_err(|e| ProtocolError::HeaderParse {
                reason: e.to_string(),
            })?;

        let trace = take_text(&mut parsed, "trace")?;
        if !trace.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::HeaderParse {
                reason: format!("trace {:?} is not numeric", trace),
            });
        }
        let code = take_text(&mut parsed, "code")?;
        let body = match parsed.remove("body") {
            Some(FieldValue::Binary(body)) => body,
            _ => Bytes::new(),
        };

        Ok(Frame { trace, code, body })
    }

    /// Wraps a body with its header.
    pub fn build(&self, trace: &str, code: &str, body: &[u8]) -> Result<BytesMut, ProtocolError> {
        if trace.len() != self.trace_width || !trace.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::HeaderBuild {
                reason: format!(
                    "trace {:?} is not {} digits",
                    trace, self.trace_width
                ),
            });
        }
        let mut values = Fields::new();
        values.insert("trace".to_string(), FieldValue::from(trace));
        values.insert("code".to_string(), FieldValue::from(code));
        values.insert(
            "body".to_string(),
            FieldValue::Binary(Bytes::copy_from_slice(body)),
        );

        let mut out = BytesMut::with_capacity(self.body_offset() + body.len());
        self.layout
            .build_into(&values, &mut out)
            .map_err(|e| ProtocolError::HeaderBuild {
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

fn take_text(parsed: &mut Fields, name: &str) -> Result<String, ProtocolError> {
    match parsed.remove(name) {
        Some(FieldValue::Text(s)) => Ok(s),
        _ => Err(ProtocolError::HeaderParse {
            reason: format!("missing {}", name),
        }),
    }
}

/// Prefixes a message with its length for the stream transport.
pub fn encode_length_prefixed(message: &[u8]) -> Result<BytesMut, ProtocolError> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: message.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + message.len());
    buf.put_u16(message.len() as u16);
    buf.put_slice(message);
    Ok(buf)
}

/// Splits a byte stream into length-prefixed messages.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete message, or `None` if more data is needed.
    pub fn next_message(&mut self) -> Option<Bytes> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
            return None;
        }
        self.buffer.advance(LENGTH_PREFIX_SIZE);
        Some(self.buffer.split_to(len).freeze())
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = HeaderLayout::new(4).unwrap();
        let raw = header.build("0042", "A0", b"0002U").unwrap();
        assert_eq!(&raw[..], b"0042A00002U");

        let frame = header.parse(&raw).unwrap();
        assert_eq!(frame.trace, "0042");
        assert_eq!(frame.code, "A0");
        assert_eq!(&frame.body[..], b"0002U");
    }

    #[test]
    fn test_header_without_body() {
        let header = HeaderLayout::new(6).unwrap();
        let frame = header.parse(b"000001NC").unwrap();
        assert_eq!(frame.code, "NC");
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_header_parse_errors() {
        let header = HeaderLayout::new(4).unwrap();
        assert!(matches!(
            header.parse(b"001"),
            Err(ProtocolError::HeaderParse { .. })
        ));
        assert!(matches!(
            header.parse(b"00X1A0"),
            Err(ProtocolError::HeaderParse { .. })
        ));
        assert!(matches!(
            header.parse(&[b'0', b'0', b'0', b'1', 0xC3, 0xA9]),
            Err(ProtocolError::HeaderParse { .. })
        ));
    }

    #[test]
    fn test_header_build_errors() {
        let header = HeaderLayout::new(4).unwrap();
        assert!(matches!(
            header.build("42", "A0", b""),
            Err(ProtocolError::HeaderBuild { .. })
        ));
        assert!(matches!(
            header.build("0042", "A00", b""),
            Err(ProtocolError::HeaderBuild { .. })
        ));
    }

    #[test]
    fn test_trace_formatting() {
        let header = HeaderLayout::new(4).unwrap();
        assert_eq!(header.format_trace(7), "0007");
        assert_eq!(header.max_trace(), 9999);
        assert_eq!(header.body_offset(), 6);

        assert!(HeaderLayout::new(0).is_err());
        assert!(HeaderLayout::new(19).is_err());
    }

    #[test]
    fn test_length_prefix_roundtrip() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_length_prefixed(b"0001NC").unwrap());
        decoder.extend(&encode_length_prefixed(b"0002NC").unwrap());

        assert_eq!(&decoder.next_message().unwrap()[..], b"0001NC");
        assert_eq!(&decoder.next_message().unwrap()[..], b"0002NC");
        assert!(decoder.next_message().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_message() {
        let encoded = encode_length_prefixed(b"0001ND00").unwrap();
        let mut decoder = FrameDecoder::default();

        decoder.extend(&encoded[..1]);
        assert!(decoder.next_message().is_none());
        decoder.extend(&encoded[1..5]);
        assert!(decoder.next_message().is_none());
        decoder.extend(&encoded[5..]);
        assert_eq!(&decoder.next_message().unwrap()[..], b"0001ND00");

        decoder.extend(b"junk");
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_message_too_large() {
        let huge = vec![b'0'; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            encode_length_prefixed(&huge),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
