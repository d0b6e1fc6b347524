//! Stream events produced by kernel executions.
//!
//! Every execution yields an ordered sequence of [`StreamEvent`]s. On the wire
//! an event is `{"type": <kind>, "data": <payload>}`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::kernel::KernelMode;

/// MIME type used for plain text payloads.
pub const MIME_TEXT_PLAIN: &str = "text/plain";
/// MIME type used for HTML payloads.
pub const MIME_TEXT_HTML: &str = "text/html";
/// MIME type used for base64-encoded PNG payloads.
pub const MIME_IMAGE_PNG: &str = "image/png";

/// Map of MIME type to payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeBundle(BTreeMap<String, serde_json::Value>);

impl MimeBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Bundle holding a single `text/plain` payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new().with(MIME_TEXT_PLAIN, serde_json::Value::String(text.into()))
    }

    /// Add a payload for a MIME type.
    pub fn with(mut self, mime: impl Into<String>, payload: serde_json::Value) -> Self {
        self.0.insert(mime.into(), payload);
        self
    }

    /// Insert a payload for a MIME type.
    pub fn insert(&mut self, mime: impl Into<String>, payload: serde_json::Value) {
        self.0.insert(mime.into(), payload);
    }

    /// Get the payload for a MIME type.
    pub fn get(&self, mime: &str) -> Option<&serde_json::Value> {
        self.0.get(mime)
    }

    /// Get the `text/plain` payload as a string.
    pub fn plain_text(&self) -> Option<&str> {
        self.get(MIME_TEXT_PLAIN).and_then(|v| v.as_str())
    }

    /// Iterate over MIME types in the bundle.
    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Output stream name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Payload of a `stream` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOutput {
    pub name: StreamName,
    pub text: String,
}

/// Payload of an `execute_result` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    /// Per-kernel execution counter.
    pub execution_count: u64,
    pub data: MimeBundle,
}

/// Payload of an `execute_error` event, also used as the error of an
/// aggregate execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl ErrorInfo {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.ename, self.evalue)
    }
}

/// Payload of `display_data` and `update_display_data` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: MimeBundle,
    #[serde(default, skip_serializing_if = "MimeBundle::is_empty")]
    pub metadata: MimeBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

/// Payload of a `kernel_info` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    pub language: String,
    pub implementation: String,
    pub implementation_version: String,
    pub mode: KernelMode,
}

/// One unit of kernel output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Stream(StreamOutput),
    ExecuteResult(ExecuteResult),
    ExecuteError(ErrorInfo),
    DisplayData(DisplayData),
    UpdateDisplayData(DisplayData),
    KernelInfo(KernelInfoReply),
}

impl StreamEvent {
    /// Create a stdout fragment.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream(StreamOutput {
            name: StreamName::Stdout,
            text: text.into(),
        })
    }

    /// Create a stderr fragment.
    pub fn stderr(text: impl Into<String>) -> Self {
        Self::Stream(StreamOutput {
            name: StreamName::Stderr,
            text: text.into(),
        })
    }

    /// The kind tag of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Stream(_) => EventKind::Stream,
            Self::ExecuteResult(_) => EventKind::ExecuteResult,
            Self::ExecuteError(_) => EventKind::ExecuteError,
            Self::DisplayData(_) => EventKind::DisplayData,
            Self::UpdateDisplayData(_) => EventKind::UpdateDisplayData,
            Self::KernelInfo(_) => EventKind::KernelInfo,
        }
    }

    /// Text of a stream event on the given stream.
    pub fn stream_text(&self, name: StreamName) -> Option<&str> {
        match self {
            Self::Stream(out) if out.name == name => Some(&out.text),
            _ => None,
        }
    }

    /// Error payload if this is an `execute_error` event.
    pub fn as_error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::ExecuteError(info) => Some(info),
            _ => None,
        }
    }
}

/// Discriminant of [`StreamEvent`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Stream,
    ExecuteResult,
    ExecuteError,
    DisplayData,
    UpdateDisplayData,
    KernelInfo,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::ExecuteResult => "execute_result",
            Self::ExecuteError => "execute_error",
            Self::DisplayData => "display_data",
            Self::UpdateDisplayData => "update_display_data",
            Self::KernelInfo => "kernel_info",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
