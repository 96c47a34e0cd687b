//! JSON Lines decoder for session output.
//!
//! [`StreamDecoder`] implements [`tokio_util::codec::Decoder`], so a
//! [`FramedRead`](tokio_util::codec::FramedRead) over a child's stdout is a
//! pull-based stream of [`StreamMessage`]s: bytes are only read from the
//! pipe when the consumer polls for the next message.
//!
//! The buffer is bounded by `max_record_bytes`. A record that grows past the
//! bound without a terminator is reported once as an oversized `error`
//! message and the rest of it is discarded up to the next newline. This
//! trades that record's data for bounded memory.

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use super::parser::{decode_error_body, parse_record};
use crate::errors::DecodeError;
use crate::models::message::{LifecycleBody, MessageBody, StreamMessage, Usage};

/// Default record bound: 1 MiB.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1_048_576;

/// Stateful newline framer and record parser for one session.
#[derive(Debug)]
pub struct StreamDecoder {
    max_record_bytes: usize,
    next_seq: u64,
    /// Index up to which the buffer is known to contain no newline.
    scan_from: usize,
    /// Dropping the tail of an oversized record until the next newline.
    discarding: bool,
    /// Total bytes consumed from the pipe, for diagnostics.
    offset: u64,
    closed: bool,
}

impl StreamDecoder {
    /// Create a decoder with the default record bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_record_bytes(DEFAULT_MAX_RECORD_BYTES)
    }

    /// Create a decoder that bounds a single record to `max_record_bytes`.
    #[must_use]
    pub fn with_max_record_bytes(max_record_bytes: usize) -> Self {
        Self {
            max_record_bytes: max_record_bytes.max(1),
            next_seq: 0,
            scan_from: 0,
            discarding: false,
            offset: 0,
            closed: false,
        }
    }

    /// Sequence number the next message will carry.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn emit(&mut self, body: MessageBody, usage: Option<Usage>, wire_len: usize) -> StreamMessage {
        let seq = self.next_seq;
        self.next_seq += 1;
        StreamMessage {
            seq,
            body,
            usage,
            wire_len,
        }
    }

    fn oversized(&mut self, discarded: &[u8]) -> StreamMessage {
        warn!(
            discarded_bytes = discarded.len(),
            limit = self.max_record_bytes,
            offset = self.offset,
            "stream decoder: oversized record discarded"
        );
        let body = decode_error_body(
            DecodeError::Oversized {
                discarded_bytes: discarded.len(),
                limit: self.max_record_bytes,
            },
            discarded,
        );
        self.emit(body, None, discarded.len())
    }

    fn record(&mut self, line: &[u8], wire_len: usize) -> Option<StreamMessage> {
        let record = line.strip_suffix(b"\r").unwrap_or(line);
        if record.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if record.len() > self.max_record_bytes {
            return Some(self.oversized(record));
        }

        let (body, usage) = parse_record(record);
        if let MessageBody::Error { .. } = body {
            debug!(offset = self.offset, "stream decoder: malformed record");
        }
        Some(self.emit(body, usage, wire_len))
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StreamDecoder {
    type Item = StreamMessage;
    type Error = std::io::Error;

    /// Decode the next complete record from `buf`.
    ///
    /// Returns `Ok(None)` while a record is incomplete. Never returns an
    /// error for bad input; malformed and oversized records come back as
    /// `error` messages.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<StreamMessage>, Self::Error> {
        loop {
            let newline = buf[self.scan_from..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|idx| idx + self.scan_from);

            let Some(pos) = newline else {
                if buf.len() > self.max_record_bytes {
                    let dropped = buf.split();
                    self.scan_from = 0;
                    self.offset += dropped.len() as u64;
                    if self.discarding {
                        return Ok(None);
                    }
                    self.discarding = true;
                    return Ok(Some(self.oversized(&dropped)));
                }
                self.scan_from = buf.len();
                return Ok(None);
            };

            let line = buf.split_to(pos + 1);
            self.scan_from = 0;
            self.offset += line.len() as u64;

            if self.discarding {
                // Tail of a record already reported as oversized.
                self.discarding = false;
                continue;
            }

            if let Some(message) = self.record(&line[..pos], line.len()) {
                return Ok(Some(message));
            }
        }
    }

    /// Flush an unterminated final record, then emit one
    /// [`LifecycleBody::StreamClosed`] marker.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<StreamMessage>, Self::Error> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }

        if !buf.is_empty() {
            let rest = buf.split();
            self.scan_from = 0;
            self.offset += rest.len() as u64;
            if self.discarding {
                self.discarding = false;
            } else if let Some(message) = self.record(&rest, rest.len()) {
                return Ok(Some(message));
            }
        }

        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        debug!(offset = self.offset, "stream decoder: end of stream");
        let body = MessageBody::Lifecycle {
            event: LifecycleBody::StreamClosed,
        };
        Ok(Some(self.emit(body, None, 0)))
    }
}
