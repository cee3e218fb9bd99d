//! Protocol error types and typed HSM error statuses.

use crate::value::Fields;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding HSM messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("configuration error in '{command}': {reason}")]
    Configuration { command: String, reason: String },

    #[error("header parse error: {reason}")]
    HeaderParse { reason: String },

    #[error("unknown response code: {0:?}")]
    UnknownResponseCode(String),

    #[error("response body parse error for '{command}': missing status code")]
    ResponseBodyParse { command: String },

    #[error("body does not match layout of '{command}': {source}")]
    BodyPatternMismatch {
        command: String,
        #[source]
        source: LayoutError,
    },

    #[error("command not implemented: {0}")]
    NotImplemented(String),

    #[error("failed to build body of '{command}': {source}")]
    BodyBuild {
        command: String,
        #[source]
        source: LayoutError,
    },

    #[error("failed to build header: {reason}")]
    HeaderBuild { reason: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns whether this error means the catalog itself is unusable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProtocolError::Configuration { .. } | ProtocolError::Yaml(_) | ProtocolError::Json(_)
        )
    }
}

/// Errors produced by a compiled field layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("invalid layout: {0}")]
    Invalid(String),

    #[error("field '{field}' needs {needed} bytes, {available} available")]
    Truncated {
        field: String,
        needed: usize,
        available: usize,
    },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Human-facing description of one HSM error status, as declared in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Stable error name.
    pub name: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Whether the request may be retried as-is.
    #[serde(default)]
    pub retryable: bool,
}

/// A non-success status returned by the HSM, resolved to a typed error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("HSM error {code} ({name}) on {method}: {message}")]
pub struct HsmError {
    /// Two-character status code from the response body.
    pub code: String,
    /// Command the status belongs to.
    pub method: String,
    /// Catalog key that produced this error (`method.code`, `code`, or empty for generic).
    pub key: String,
    pub name: String,
    pub message: String,
    pub retryable: bool,
    /// Fields parsed with the command's error layout (always contains `error_code`).
    pub fields: Fields,
}

/// Maps `(method, code)` pairs to typed errors.
///
/// Lookup order is `method.code`, then bare `code`, then a generic error.
#[derive(Debug, Clone, Default)]
pub struct ErrorCatalog {
    entries: HashMap<String, ErrorDescriptor>,
}

/// Name given to statuses with no catalog entry.
pub const GENERIC_ERROR_NAME: &str = "HSM_ERROR";

impl ErrorCatalog {
    pub fn new(entries: HashMap<String, ErrorDescriptor>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, key: impl Into<String>, descriptor: ErrorDescriptor) {
        self.entries.insert(key.into(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a status code returned for `method` into a typed error.
    pub fn resolve(&self, method: &str, code: &str, fields: Fields) -> HsmError {
        let scoped = format!("{}.{}", method, code);
        let found = self
            .entries
            .get(&scoped)
            .map(|d| (scoped.clone(), d))
            .or_else(|| self.entries.get(code).map(|d| (code.to_string(), d)));

        match found {
            Some((key, descriptor)) => HsmError {
                code: code.to_string(),
                method: method.to_string(),
                key,
                name: descriptor.name.clone(),
                message: descriptor.message.clone(),
                retryable: descriptor.retryable,
                fields,
            },
            None => HsmError {
                code: code.to_string(),
                method: method.to_string(),
                key: String::new(),
                name: GENERIC_ERROR_NAME.to_string(),
                message: format!("HSM returned status {}", code),
                retryable: false,
                fields,
            },
        }
    }
}
