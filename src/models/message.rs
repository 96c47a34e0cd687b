//! Structured output messages decoded from a session's stdout.

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

/// Token accounting attached to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Input units consumed.
    #[serde(default, alias = "input_tokens")]
    pub input_units: u64,
    /// Output units produced.
    #[serde(default, alias = "output_tokens")]
    pub output_units: u64,
}

/// One decoded record. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    /// Monotonic per-session sequence number starting at 0.
    pub seq: u64,
    /// Decoded content.
    pub body: MessageBody,
    /// Usage summary when the record carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Bytes this message accounted for on the wire, terminator included.
    #[serde(skip)]
    pub wire_len: usize,
}

/// Closed set of record kinds plus a forward-compatible catch-all.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// `type: "system"`: initialization and environment notices.
    System {
        /// Optional `subtype` field.
        subtype: Option<String>,
        /// Full record.
        payload: serde_json::Value,
    },
    /// Incremental output (`assistant`, `user`, `partial`, `stream_event`).
    PartialOutput {
        /// Full record.
        payload: serde_json::Value,
    },
    /// `type: "result"`: the final structured result of a turn.
    Result {
        /// Value of the record's `is_error` flag.
        is_error: bool,
        /// Full record.
        payload: serde_json::Value,
    },
    /// A reported or decode-level error.
    Error {
        /// What went wrong.
        error: ErrorBody,
    },
    /// A lifecycle notice.
    Lifecycle {
        /// Which notice.
        event: LifecycleBody,
    },
    /// Well-formed record with an unrecognized `type`.
    Unknown {
        /// The unrecognized discriminator.
        type_name: String,
        /// Raw record text.
        raw: String,
    },
}

/// Origin of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ErrorBody {
    /// The decoder could not parse a record.
    Decode {
        /// Decode failure.
        error: DecodeError,
        /// Offending text, lossily decoded and truncated.
        raw: String,
    },
    /// The process itself emitted `type: "error"`.
    Reported {
        /// Full record.
        payload: serde_json::Value,
    },
}

/// Lifecycle notices carried in the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum LifecycleBody {
    /// The process emitted `type: "lifecycle"`.
    Reported {
        /// Full record.
        payload: serde_json::Value,
    },
    /// The output pipe reached end of file.
    StreamClosed,
}

impl StreamMessage {
    /// Whether this message reports a decode or process error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.body, MessageBody::Error { .. })
    }

    /// Short discriminator used in logs.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match &self.body {
            MessageBody::System { .. } => "system",
            MessageBody::PartialOutput { .. } => "partial_output",
            MessageBody::Result { .. } => "result",
            MessageBody::Error { .. } => "error",
            MessageBody::Lifecycle { .. } => "lifecycle",
            MessageBody::Unknown { type_name, .. } => type_name,
        }
    }
}
