//! Pull-based view of a session's decoded output.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::process::ChildStdout;
use tokio_util::codec::FramedRead;
use tracing::warn;

use super::registry::SessionRegistry;
use crate::models::message::StreamMessage;
use crate::models::session::SessionId;
use crate::stream::StreamDecoder;

/// Stream of [`StreamMessage`]s read from a session's stdout.
///
/// Bytes are only read from the pipe while the consumer polls, so a slow
/// consumer leaves the child blocked on a full pipe instead of growing a
/// buffer. The stream ends after the final `stream_closed` lifecycle
/// message, or early on a pipe read error.
#[derive(Debug)]
pub struct OutputStream {
    session_id: SessionId,
    frames: FramedRead<ChildStdout, StreamDecoder>,
    registry: Arc<SessionRegistry>,
    done: bool,
}

impl OutputStream {
    pub(crate) fn new(
        session_id: SessionId,
        stdout: ChildStdout,
        decoder: StreamDecoder,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            session_id,
            frames: FramedRead::new(stdout, decoder),
            registry,
            done: false,
        }
    }

    /// Session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Stream for OutputStream {
    type Item = StreamMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.frames).poll_next(cx) {
            Poll::Ready(Some(Ok(message))) => {
                this.registry
                    .record_output(&this.session_id, message.wire_len as u64, 1);
                Poll::Ready(Some(message))
            }
            Poll::Ready(Some(Err(err))) => {
                warn!(session_id = %this.session_id, %err, "session output read failed");
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
