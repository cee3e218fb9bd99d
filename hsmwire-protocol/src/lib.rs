//! # hsmwire-protocol
//!
//! Wire protocol for payment HSMs speaking the fixed-width command format
//! (trace number, two-character command code, positional body).
//!
//! This crate provides:
//! - A declarative command catalog compiled into a [`CommandTable`]
//! - Field layouts with string, zero-padded, binary, hex and numeric encodings
//! - Header framing and the 2-byte length prefix used on TCP
//! - Outbound field transforms (upper-casing, key-scheme delimiters)
//! - Log masking of sensitive fields
//! - A per-connection [`Codec`] with trace correlation and status classification

pub mod catalog;
pub mod codec;
pub mod error;
pub mod frame;
pub mod layout;
pub mod mask;
pub mod transform;
pub mod value;

pub use catalog::{Catalog, CommandEntry, CommandSpec, CommandTable, Direction, SUCCESS_CODE};
pub use codec::{Codec, CodecConfig, ConnectionContext, ExchangeMeta, Outcome, STATUS_FIELD};
pub use error::{ErrorCatalog, ErrorDescriptor, HsmError, LayoutError, ProtocolError};
pub use frame::{encode_length_prefixed, Frame, FrameDecoder, HeaderLayout, MAX_MESSAGE_SIZE};
pub use layout::{Encoding, FieldSpec, Layout, LayoutSource};
pub use mask::{mask, MaskRules};
pub use transform::{FieldTransforms, KeySchemeRule};
pub use value::{fields, FieldValue, Fields};

/// Default TCP port of payShield-compatible HSMs.
pub const DEFAULT_PORT: u16 = 1500;
