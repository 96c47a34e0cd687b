//! Record parsing for framed output lines.
//!
//! Turns one newline-free record into a [`MessageBody`]. Parsing never
//! fails: anything that is not a JSON object with a string `type` becomes an
//! `error` body carrying the raw text.
//!
//! # Known record types
//!
//! | `type`                                             | Maps to                          |
//! |----------------------------------------------------|----------------------------------|
//! | `system`                                           | [`MessageBody::System`]          |
//! | `assistant`, `user`, `partial`, `stream_event`     | [`MessageBody::PartialOutput`]   |
//! | `result`                                           | [`MessageBody::Result`]          |
//! | `error`                                            | [`MessageBody::Error`]           |
//! | `lifecycle`                                        | [`MessageBody::Lifecycle`]       |
//! | *(any other)*                                      | [`MessageBody::Unknown`]         |

use serde_json::Value;
use tracing::debug;

use crate::errors::DecodeError;
use crate::models::message::{ErrorBody, LifecycleBody, MessageBody, Usage};

/// Upper bound on raw text copied into an error message.
pub const RAW_EXCERPT_BYTES: usize = 4096;

/// Parse one record (without its terminator).
#[must_use]
pub fn parse_record(record: &[u8]) -> (MessageBody, Option<Usage>) {
    let text = match std::str::from_utf8(record) {
        Ok(text) => text,
        Err(err) => return (malformed(format!("invalid utf-8: {err}"), record), None),
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return (malformed(format!("invalid json: {err}"), record), None),
    };

    let Some(object) = value.as_object() else {
        return (malformed("record is not a JSON object".into(), record), None);
    };
    let Some(type_name) = object.get("type").and_then(Value::as_str).map(ToOwned::to_owned)
    else {
        return (
            malformed("missing string `type` discriminator".into(), record),
            None,
        );
    };

    let usage = object
        .get("usage")
        .and_then(|raw| serde_json::from_value::<Usage>(raw.clone()).ok());
    let subtype = object
        .get("subtype")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let is_error = object
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let body = match type_name.as_str() {
        "system" => MessageBody::System {
            subtype,
            payload: value,
        },
        "assistant" | "user" | "partial" | "stream_event" => {
            MessageBody::PartialOutput { payload: value }
        }
        "result" => MessageBody::Result {
            is_error,
            payload: value,
        },
        "error" => MessageBody::Error {
            error: ErrorBody::Reported { payload: value },
        },
        "lifecycle" => MessageBody::Lifecycle {
            event: LifecycleBody::Reported { payload: value },
        },
        _ => {
            debug!(
                type_name = type_name.as_str(),
                "stream parser: unrecognized record type"
            );
            MessageBody::Unknown {
                type_name,
                raw: text.to_owned(),
            }
        }
    };

    (body, usage)
}

/// Build an `error` body for a decode failure.
#[must_use]
pub fn decode_error_body(error: DecodeError, raw: &[u8]) -> MessageBody {
    MessageBody::Error {
        error: ErrorBody::Decode {
            error,
            raw: excerpt(raw),
        },
    }
}

fn malformed(detail: String, raw: &[u8]) -> MessageBody {
    decode_error_body(DecodeError::Malformed { detail }, raw)
}

/// Lossy UTF-8 rendering of at most [`RAW_EXCERPT_BYTES`] bytes.
fn excerpt(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(&raw[..raw.len().min(RAW_EXCERPT_BYTES)]);
    text.into_owned()
}
