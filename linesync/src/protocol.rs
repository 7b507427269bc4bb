//! Wire types exchanged with the snapshot and range-replace services.
//!
//! Snapshots arrive as JSON:
//! ```text
//! {
//!   "documentId": "<uuid>",
//!   "content": <one of the four content shapes>,
//!   "lineAuthors": { "1": "alice", "2": "bob" },     // optional
//!   "lineLocks":   { "2": "bob" },                   // optional
//!   "presence":    [ { "participantId": "bob", ... } ]
//! }
//! ```
//!
//! Accepted content shapes:
//! ```text
//! ["a", "b"]                  line array
//! {"content": ["a", "b"]}     nested line array
//! "a\nb"                      joined string
//! {"content": "a\nb"}         nested joined string
//! ```
//!
//! Everything is normalized into a [`DocumentSnapshot`] at the boundary;
//! nothing past [`RawSnapshot::normalize`] looks at the wire shape again.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ServiceError, SyncError};

/// 1-based line number, as used by the services.
pub type LineNumber = u32;

/// Map from 1-based line number to a participant.
pub type LineMap = BTreeMap<LineNumber, ParticipantId>;

/// Identifier of a shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server-assigned participant identity. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote caret position, 1-based line and 0-based column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: LineNumber,
    pub column: u32,
}

/// One participant's presence as reported by the snapshot service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub participant_id: ParticipantId,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    /// Milliseconds since the Unix epoch on the wire.
    #[serde(rename = "lastActivityTimestamp", with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
}

impl PresenceRecord {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: ParticipantId::new(participant_id),
            cursor: None,
            last_activity: Utc::now(),
            is_active: true,
        }
    }

    pub fn with_cursor(mut self, line: LineNumber, column: u32) -> Self {
        self.cursor = Some(CursorPosition { line, column });
        self
    }
}

/// The four content shapes the snapshot service may answer with.
///
/// Variant order matters for untagged decoding: arrays and strings are
/// tried before the nested object forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Lines(Vec<String>),
    Joined(String),
    NestedLines { content: Vec<String> },
    NestedJoined { content: String },
}

impl WireContent {
    /// Decode a raw JSON content value.
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        let shape = describe_shape(&value);
        serde_json::from_value(value).map_err(|_| SyncError::UnrecognizedContent(shape))
    }

    /// Number of lines the server holds, before empty-document collapsing.
    pub fn server_line_count(&self) -> usize {
        match self {
            WireContent::Lines(lines) | WireContent::NestedLines { content: lines } => lines.len(),
            WireContent::Joined(text) | WireContent::NestedJoined { content: text } => line_count_of(text),
        }
    }

    /// Normalize to one string per line.
    ///
    /// Content consisting solely of empty lines is the empty document and
    /// normalizes to no lines at all.
    pub fn into_lines(self) -> Vec<String> {
        let lines = match self {
            WireContent::Lines(lines) | WireContent::NestedLines { content: lines } => lines,
            WireContent::Joined(text) | WireContent::NestedJoined { content: text } => {
                split_lines(&text)
            }
        };

        if lines.iter().all(|line| line.is_empty()) {
            Vec::new()
        } else {
            lines
        }
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

/// Short human description of a JSON value, for shape errors.
fn describe_shape(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(_) => "number".into(),
        Value::String(_) => "string".into(),
        Value::Array(items) => {
            if items.iter().all(Value::is_string) {
                "array of strings".into()
            } else {
                "array with non-string items".into()
            }
        }
        Value::Object(map) => match map.get("content") {
            None => "object without `content`".into(),
            Some(inner) => format!("object with `content` of {}", describe_shape(inner)),
        },
    }
}

/// Snapshot exactly as received from the snapshot service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnapshot {
    pub document_id: DocumentId,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_authors: Option<LineMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_locks: Option<LineMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceRecord>>,
}

impl RawSnapshot {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ServiceError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ServiceError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Normalize the content shape. Fails without partial output when the
    /// content matches none of the accepted shapes.
    pub fn normalize(self) -> Result<DocumentSnapshot, SyncError> {
        let content = WireContent::from_value(self.content)?;
        Ok(DocumentSnapshot {
            document_id: self.document_id,
            server_line_count: content.server_line_count(),
            content_lines: content.into_lines(),
            line_authors: self.line_authors,
            line_locks: self.line_locks,
            presence: self.presence.unwrap_or_default(),
        })
    }
}

/// Normalized, immutable snapshot of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub content_lines: Vec<String>,
    /// Lines the server actually holds. Differs from `content_lines.len()`
    /// when a run of blank lines was collapsed to the empty document.
    pub server_line_count: usize,
    /// `None` when the service omitted the field entirely.
    pub line_authors: Option<LineMap>,
    /// `None` when the service omitted the field entirely.
    pub line_locks: Option<LineMap>,
    pub presence: Vec<PresenceRecord>,
}

impl DocumentSnapshot {
    /// Content joined with `\n`.
    pub fn text(&self) -> String {
        self.content_lines.join("\n")
    }

    pub fn line_count(&self) -> usize {
        self.content_lines.len()
    }
}

/// Number of lines the server will hold after storing `text`.
pub fn line_count_of(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.split('\n').count()
    }
}

/// "Replace lines `[start_line, end_line_exclusive)` with `text`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceCommand {
    pub document_id: DocumentId,
    pub start_line: LineNumber,
    pub end_line_exclusive: LineNumber,
    pub text: String,
}

impl ReplaceCommand {
    /// Replace every line the server currently holds with `text`.
    pub fn whole_document(document_id: DocumentId, server_line_count: usize, text: String) -> Self {
        let end = LineNumber::try_from(server_line_count)
            .unwrap_or(LineNumber::MAX - 1)
            .saturating_add(1);
        Self {
            document_id,
            start_line: 1,
            end_line_exclusive: end,
            text,
        }
    }
}

/// Acknowledgement of a durable replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceAck {
    pub document_id: DocumentId,
    pub revision: u64,
}
