//! Out-of-band event delivery.

use std::fmt;

use tokio::sync::mpsc;

use crate::payload::encode_payload;

/// Destination for events produced off the caller's context.
///
/// Emission never blocks and never fails from the producer's point of view;
/// a sink whose consumer has gone away drops events.
pub trait EventSink<E>: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: E);
}

impl<E: Send> EventSink<E> for mpsc::UnboundedSender<E> {
    fn emit(&self, event: E) {
        let _ = self.send(event);
    }
}

/// What happened on a stream session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEventKind {
    /// One response item produced by the remote stream.
    Data(Vec<u8>),
    /// The remote stream failed; no further events follow for this session.
    Error(String),
}

/// One event for one stream session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    /// The caller-chosen session id.
    pub session_id: String,
    /// Event payload.
    pub kind: StreamEventKind,
}

impl StreamEvent {
    /// A data event.
    pub fn data(session_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: StreamEventKind::Data(payload),
        }
    }

    /// An error event.
    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: StreamEventKind::Error(message.into()),
        }
    }

    /// Event type tag as seen by callers: `"data"` or `"error"`.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            StreamEventKind::Data(_) => "data",
            StreamEventKind::Error(_) => "error",
        }
    }

    /// Base64 data for data events.
    pub fn encoded_data(&self) -> Option<String> {
        match &self.kind {
            StreamEventKind::Data(bytes) => Some(encode_payload(bytes)),
            StreamEventKind::Error(_) => None,
        }
    }

    /// Error message for error events.
    pub fn error_message(&self) -> Option<&str> {
        match &self.kind {
            StreamEventKind::Data(_) => None,
            StreamEventKind::Error(msg) => Some(msg),
        }
    }
}

/// One line appended to the node's log file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine(pub String);

impl LogLine {
    /// The line text without its terminator.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
