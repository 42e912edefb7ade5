//! Shared wire envelope for the channel/event transport.
//!
//! This crate owns the wire representation used by every bus endpoint. The
//! envelope is a flat JSON object; payload arguments stay flexible
//! (`serde_json::Value`) so the bus never needs a schema for what it carries.
//!
//! DESIGN
//! ======
//! - One envelope shape for all six message kinds; optional fields are simply
//!   absent on the wire.
//! - Arguments travel in `data` as a positional array. An argument may opt in
//!   to per-element encoding: its value is serialized to its own JSON string
//!   and its position is recorded in `dataInfos` as an `[index, tag]` pair, so
//!   complex typed payloads embed inside the generic envelope without an
//!   a-priori schema. Receivers re-deserialize exactly those positions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned by [`decode_envelope`] and [`decode_args`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a JSON envelope, or a required
    /// field (`req`, `senderId`) is missing or of the wrong shape.
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),
    /// A `request` or `event` envelope arrived without an event `type`.
    #[error("envelope of kind `{0}` is missing `type`")]
    MissingEventType(MessageKind),
    /// A position named by `dataInfos` does not hold a parsable JSON string.
    #[error("tagged element at index {index} (tag `{tag}`) is not valid JSON: {source}")]
    TaggedElement {
        index: usize,
        tag: String,
        source: serde_json::Error,
    },
}

// =============================================================================
// MESSAGE KIND
// =============================================================================

/// Protocol position of an envelope.
///
/// A remote request walks `request → requestAck → requestExecute →
/// requestResult`; `event` and `log` are fire-and-forget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Probe for a remote endpoint holding a matching handler.
    Request,
    /// A remote endpoint volunteers to execute the request.
    RequestAck,
    /// Requester replays the full payload to the acknowledging endpoint.
    RequestExecute,
    /// Responder returns the collected handler results.
    RequestResult,
    /// Fire-and-forget broadcast to every listener.
    Event,
    /// Remote log line, routed into the receiver's logging.
    Log,
}

impl MessageKind {
    /// The exact string this kind serializes to on the wire.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::RequestAck => "requestAck",
            Self::RequestExecute => "requestExecute",
            Self::RequestResult => "requestResult",
            Self::Event => "event",
            Self::Log => "log",
        }
    }

    /// Kinds that are meaningless without an event `type`.
    #[must_use]
    pub fn requires_event_type(self) -> bool {
        matches!(self, Self::Request | Self::Event)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// =============================================================================
// DATA INFO
// =============================================================================

/// `[index, tag]` pair marking one per-element-encoded argument position.
///
/// Serializes as a two-element JSON array, not an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataInfo(pub usize, pub String);

impl DataInfo {
    #[must_use]
    pub fn index(&self) -> usize {
        self.0
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.1
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// A single message on the event wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol position of this message.
    pub req: MessageKind,
    /// Event name; required for `request` and `event`, inherited by replies.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Connection id of the originating endpoint. Receivers drop their own
    /// echoes by comparing this against their local connection id.
    #[serde(rename = "senderId")]
    pub sender_id: u32,
    /// Correlation id tying the four request messages together.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// Positional payload arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    /// Per-element encoding markers; presence signals that the named `data`
    /// positions hold embedded JSON strings.
    #[serde(rename = "dataInfos", default, skip_serializing_if = "Option::is_none")]
    pub data_infos: Option<Vec<DataInfo>>,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Envelope {
    fn new(req: MessageKind, sender_id: u32) -> Self {
        Self {
            req,
            event_type: None,
            sender_id,
            request_id: None,
            data: None,
            data_infos: None,
        }
    }

    /// Create the opening `request` probe for an event type.
    pub fn request(event_type: impl Into<String>, sender_id: u32, request_id: u64) -> Self {
        let mut envelope = Self::new(MessageKind::Request, sender_id);
        envelope.event_type = Some(event_type.into());
        envelope.request_id = Some(request_id);
        envelope
    }

    /// Create a fire-and-forget `event`.
    pub fn event(event_type: impl Into<String>, sender_id: u32) -> Self {
        let mut envelope = Self::new(MessageKind::Event, sender_id);
        envelope.event_type = Some(event_type.into());
        envelope
    }

    /// Create a `log` message.
    #[must_use]
    pub fn log(sender_id: u32) -> Self {
        Self::new(MessageKind::Log, sender_id)
    }

    /// Build a reply of the given kind. Inherits `type` and `requestId`.
    #[must_use]
    pub fn reply(&self, req: MessageKind, sender_id: u32) -> Self {
        Self {
            req,
            event_type: self.event_type.clone(),
            sender_id,
            request_id: self.request_id,
            data: None,
            data_infos: None,
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Envelope {
    #[must_use]
    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_data_infos(mut self, infos: Vec<DataInfo>) -> Self {
        self.data_infos = if infos.is_empty() { None } else { Some(infos) };
        self
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode an envelope into JSON bytes.
#[must_use]
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    // Serializing this struct is infallible: every field maps to plain JSON
    // and `Value` maps are string-keyed.
    serde_json::to_vec(envelope).unwrap_or_default()
}

/// Decode JSON bytes into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed JSON or missing required
/// fields, and [`CodecError::MissingEventType`] when a `request` or `event`
/// envelope carries no `type`.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.req.requires_event_type() && envelope.event_type.is_none() {
        return Err(CodecError::MissingEventType(envelope.req));
    }
    Ok(envelope)
}

// =============================================================================
// ARGUMENT CODEC
// =============================================================================

/// One positional argument of an event or request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum EventArg {
    /// Passed through the generic JSON encoder untouched.
    Plain(Value),
    /// Encoded per-element: serialized to its own JSON string on the wire,
    /// with the position recorded in `dataInfos` under `tag`.
    Tagged { tag: String, value: Value },
}

impl EventArg {
    pub fn plain(value: impl Into<Value>) -> Self {
        Self::Plain(value.into())
    }

    pub fn tagged(tag: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Tagged { tag: tag.into(), value: value.into() }
    }
}

/// Encode an argument list into the wire `data` array plus its `dataInfos`.
#[must_use]
pub fn encode_args(args: &[EventArg]) -> (Vec<Value>, Option<Vec<DataInfo>>) {
    let mut data = Vec::with_capacity(args.len());
    let mut infos = Vec::new();

    for (index, arg) in args.iter().enumerate() {
        match arg {
            EventArg::Plain(value) => data.push(value.clone()),
            EventArg::Tagged { tag, value } => {
                // `Value::to_string` renders compact JSON.
                data.push(Value::String(value.to_string()));
                infos.push(DataInfo(index, tag.clone()));
            }
        }
    }

    let infos = if infos.is_empty() { None } else { Some(infos) };
    (data, infos)
}

/// Decode a wire `data` array back into argument values.
///
/// Positions named by `data_infos` are re-deserialized from their embedded
/// JSON strings; every other position is returned verbatim. An `[index, tag]`
/// pair whose index is out of range is ignored.
///
/// # Errors
///
/// Returns [`CodecError::TaggedElement`] when a tagged position holds a
/// string that is not valid JSON.
pub fn decode_args(data: &[Value], data_infos: Option<&[DataInfo]>) -> Result<Vec<Value>, CodecError> {
    let mut out = data.to_vec();
    let Some(infos) = data_infos else {
        return Ok(out);
    };

    for info in infos {
        let Some(slot) = out.get_mut(info.index()) else {
            continue;
        };
        if let Value::String(raw) = slot {
            match serde_json::from_str(raw) {
                Ok(value) => *slot = value,
                Err(source) => {
                    return Err(CodecError::TaggedElement {
                        index: info.index(),
                        tag: info.tag().to_owned(),
                        source,
                    });
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
