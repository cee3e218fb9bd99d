//! Per-connection encoder and decoder for HSM messages.

use crate::catalog::{command_key, CommandSpec, CommandTable, Direction, SUCCESS_CODE};
use crate::error::{HsmError, ProtocolError};
use crate::frame::HeaderLayout;
use crate::layout::Layout;
use crate::mask::{mask, MaskRules};
use crate::transform::{FieldTransforms, KeySchemeRule};
use crate::value::{FieldValue, Fields};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Level;

/// Name of the status field exposed in response fields.
pub const STATUS_FIELD: &str = "error_code";

/// Default number of digits in the trace number.
pub const DEFAULT_TRACE_WIDTH: usize = 4;

/// Codec settings shared by every connection of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Digits in the trace number.
    pub trace_width: usize,
    /// Fields masked in logged frames.
    pub masking: MaskRules,
    /// Text fields that must keep their case.
    pub non_correctable_fields: Vec<String>,
    /// Key-scheme delimiter rules applied before encoding.
    pub key_schemes: Vec<KeySchemeRule>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            trace_width: DEFAULT_TRACE_WIDTH,
            masking: MaskRules::default(),
            non_correctable_fields: Vec::new(),
            key_schemes: vec![KeySchemeRule::default()],
        }
    }
}

/// Metadata describing one logical exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangeMeta {
    /// Command name, optionally namespaced (`hsm.generate_key`).
    pub method: String,
    pub message_type: Option<Direction>,
    /// Trace number correlating request and response.
    pub trace: Option<String>,
    /// Status code of a decoded response, including warning codes.
    pub status_code: Option<String>,
}

impl ExchangeMeta {
    pub fn request(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            message_type: Some(Direction::Request),
            ..Self::default()
        }
    }

    pub fn response(method: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            message_type: Some(Direction::Response),
            trace: Some(trace.into()),
            ..Self::default()
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Whether the decoded status was a warning rather than plain success.
    pub fn is_warning(&self) -> bool {
        self.status_code
            .as_deref()
            .is_some_and(|code| code != SUCCESS_CODE)
    }
}

/// Per-connection state: the next trace number to assign.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    next_trace: u64,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next_trace: u64) -> Self {
        Self { next_trace }
    }

    /// The value the next request will carry.
    pub fn peek(&self) -> u64 {
        self.next_trace
    }

    fn advance(&mut self, header: &HeaderLayout) -> String {
        let current = if self.next_trace > header.max_trace() {
            0
        } else {
            self.next_trace
        };
        self.next_trace = if current >= header.max_trace() {
            0
        } else {
            current + 1
        };
        header.format_trace(current)
    }
}

/// Classified result of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `"00"` or a warning status; fields of the full layout.
    Success(Fields),
    /// Any other status, resolved through the error catalog.
    Failure(HsmError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn into_result(self) -> Result<Fields, HsmError> {
        match self {
            Outcome::Success(fields) => Ok(fields),
            Outcome::Failure(err) => Err(err),
        }
    }
}

/// Encoder/decoder bound to one connection.
///
/// Trace numbers are assigned from the connection's own counter, so a codec
/// must not be shared between connections and its calls must be ordered.
pub struct Codec {
    table: Arc<CommandTable>,
    header: HeaderLayout,
    status: Layout,
    opaque_rest: Layout,
    transforms: FieldTransforms,
    masking: MaskRules,
    context: ConnectionContext,
}

impl Codec {
    pub fn new(table: Arc<CommandTable>, config: &CodecConfig) -> Result<Self, ProtocolError> {
        Self::with_context(table, config, ConnectionContext::new())
    }

    pub fn with_context(
        table: Arc<CommandTable>,
        config: &CodecConfig,
        context: ConnectionContext,
    ) -> Result<Self, ProtocolError> {
        let status = Layout::parse_expr("error_code:16/string, remainder:*/binary").map_err(|e| {
            ProtocolError::Configuration {
                command: "status".to_string(),
                reason: e.to_string(),
            }
        })?;
        let opaque_rest = Layout::parse_expr("rest:*/binary").map_err(|e| {
            ProtocolError::Configuration {
                command: "status".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            table,
            header: HeaderLayout::new(config.trace_width)?,
            status,
            opaque_rest,
            transforms: FieldTransforms::new(
                config.key_schemes.clone(),
                config.non_correctable_fields.iter().cloned(),
            ),
            masking: config.masking.clone(),
            context,
        })
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn header(&self) -> &HeaderLayout {
        &self.header
    }

    pub fn table(&self) -> &Arc<CommandTable> {
        &self.table
    }

    /// Encodes `fields` as the message described by `meta`.
    ///
    /// Requests without a trace draw one from the connection counter;
    /// responses reuse the trace of the request they answer. The assigned
    /// trace is written back into `meta`.
    pub fn encode(
        &mut self,
        fields: &Fields,
        meta: &mut ExchangeMeta,
    ) -> Result<BytesMut, ProtocolError> {
        let direction = meta.message_type.unwrap_or(Direction::Request);
        let method = last_segment(&meta.method);
        let spec = self
            .table
            .lookup_by_name(method, direction)
            .ok_or_else(|| ProtocolError::NotImplemented(command_key(method, direction)))?;

        let trace = match (direction, meta.trace.as_ref()) {
            (_, Some(trace)) => trace.clone(),
            (Direction::Request, None) => self.context.advance(&self.header),
            (Direction::Response, None) => {
                return Err(ProtocolError::HeaderBuild {
                    reason: format!("response {} has no trace to reuse", spec.key()),
                })
            }
        };

        let mut values = self.transforms.apply(fields);
        let (body, layout) = self.build_body(&spec, &mut values)?;
        let raw = self.header.build(&trace, &spec.code, &body)?;

        meta.trace = Some(trace);
        meta.message_type = Some(direction);
        if tracing::enabled!(Level::TRACE) {
            tracing::trace!(
                "encoded {} trace={} frame={}",
                spec.key(),
                meta.trace.as_deref().unwrap_or_default(),
                self.render(&raw, direction, &values, layout)
            );
        }
        Ok(raw)
    }

    fn build_body<'a>(
        &self,
        spec: &'a CommandSpec,
        values: &mut Fields,
    ) -> Result<(BytesMut, Option<&'a Layout>), ProtocolError> {
        let build_error = |source| ProtocolError::BodyBuild {
            command: spec.key(),
            source,
        };

        if spec.direction == Direction::Request {
            let body = spec.layout.build(values).map_err(build_error)?;
            return Ok((body, Some(&spec.layout)));
        }

        let status = values
            .entry(STATUS_FIELD.to_string())
            .or_insert_with(|| FieldValue::from(SUCCESS_CODE))
            .clone();
        let mut body = BytesMut::new();
        if let Some(field) = self.status.field(STATUS_FIELD) {
            field.encode_value(&status, &mut body).map_err(build_error)?;
        }

        let status = status.to_string();
        let layout = if spec.is_success(&status) {
            &spec.layout
        } else {
            match &spec.error_layout {
                Some(layout) => layout,
                None => return Ok((body, None)),
            }
        };
        layout.build_into(values, &mut body).map_err(build_error)?;
        Ok((body, Some(layout)))
    }

    /// Decodes one message and classifies it.
    ///
    /// Malformed frames are returned as errors. Error statuses are not
    /// errors of this call: they come back as [`Outcome::Failure`].
    pub fn decode(&mut self, raw: &[u8], meta: &mut ExchangeMeta) -> Result<Outcome, ProtocolError> {
        let frame = self.header.parse(raw)?;
        meta.trace = Some(frame.trace.clone());
        let spec = self
            .table
            .lookup_by_code(&frame.code)
            .ok_or_else(|| ProtocolError::UnknownResponseCode(frame.code.clone()))?;

        meta.method = spec.name.clone();
        meta.message_type = Some(spec.direction);

        if spec.direction == Direction::Request {
            let fields = spec
                .layout
                .parse(&frame.body)
                .map_err(|source| ProtocolError::BodyPatternMismatch {
                    command: spec.key(),
                    source,
                })?;
            self.log_decoded(raw, &spec, &fields, Some(&spec.layout));
            return Ok(Outcome::Success(fields));
        }

        let mut status_fields = self
            .status
            .parse(&frame.body)
            .map_err(|_| ProtocolError::ResponseBodyParse {
                command: spec.key(),
            })?;
        let status = match status_fields.remove(STATUS_FIELD) {
            Some(FieldValue::Text(code)) => code,
            _ => {
                return Err(ProtocolError::ResponseBodyParse {
                    command: spec.key(),
                })
            }
        };
        let remainder = match status_fields.remove("remainder") {
            Some(FieldValue::Binary(b)) => b,
            _ => Default::default(),
        };
        meta.status_code = Some(status.clone());

        if spec.is_success(&status) {
            let mut fields = spec.layout.parse(&remainder).map_err(|source| {
                ProtocolError::BodyPatternMismatch {
                    command: spec.key(),
                    source,
                }
            })?;
            fields.insert(STATUS_FIELD.to_string(), FieldValue::Text(status.clone()));
            if status != SUCCESS_CODE {
                tracing::debug!(
                    "{} trace={} completed with warning status {}",
                    spec.key(),
                    frame.trace,
                    status
                );
            }
            self.log_decoded(raw, &spec, &fields, Some(&spec.layout));
            return Ok(Outcome::Success(fields));
        }

        let (mut fields, layout) = match &spec.error_layout {
            Some(layout) => match layout.parse(&remainder) {
                Ok(fields) => (fields, Some(layout)),
                Err(e) => {
                    tracing::debug!(
                        "{} trace={} error body does not match error layout: {}",
                        spec.key(),
                        frame.trace,
                        e
                    );
                    (Fields::new(), None)
                }
            },
            None => (Fields::new(), None),
        };
        fields.insert(STATUS_FIELD.to_string(), FieldValue::Text(status.clone()));
        let err = self.table.errors().resolve(&spec.name, &status, fields);
        tracing::warn!(
            "{} trace={} failed with status {} ({})",
            spec.key(),
            frame.trace,
            status,
            err.name
        );
        self.log_decoded(raw, &spec, &err.fields, layout);
        Ok(Outcome::Failure(err))
    }

    fn log_decoded(
        &self,
        raw: &[u8],
        spec: &CommandSpec,
        fields: &Fields,
        layout: Option<&Layout>,
    ) {
        if tracing::enabled!(Level::TRACE) {
            tracing::trace!(
                "decoded {} frame={}",
                spec.key(),
                self.render(raw, spec.direction, fields, layout)
            );
        }
    }

    /// Offset of the first layout field; response layouts follow the status.
    fn body_start(&self, direction: Direction) -> usize {
        let status = match direction {
            Direction::Request => 0,
            Direction::Response => self
                .status
                .field(STATUS_FIELD)
                .and_then(|f| f.byte_width())
                .unwrap_or_default(),
        };
        self.header.body_offset() + status
    }

    /// Masked rendering of a frame. Without a layout everything after the
    /// status is masked.
    fn render(
        &self,
        raw: &[u8],
        direction: Direction,
        fields: &Fields,
        layout: Option<&Layout>,
    ) -> String {
        let start = self.body_start(direction);
        match layout {
            Some(layout) => mask(raw, start, fields, layout, &self.masking),
            None => mask(raw, start, fields, &self.opaque_rest, &self.masking),
        }
    }
}

/// Final `.`-separated segment of a method name.
pub fn last_segment(method: &str) -> &str {
    method.rsplit('.').next().unwrap_or(method)
}
