//! Collaboration message schema for poem editing channels.
//!
//! Every event exchanged over a poem channel is one of five tagged
//! shapes, discriminated by a `type` field on the wire:
//!
//! ```text
//! {"type":"edit",      "content":"..."}
//! {"type":"cursor",    "cursor":{"position":12,"userId":"…","userName":"…"}}
//! {"type":"selection", "selection":{"start":0,"end":4,"userId":"…","userName":"…"}}
//! {"type":"join",      "poemId":"…","userId":"…"}
//! {"type":"leave",     "poemId":"…","userId":"…"}
//! ```
//!
//! The set is closed: any other `type` value is rejected outright, with
//! no fallback branch. [`validate`] checks an arbitrary JSON value
//! against the union and reports *every* field-level violation, not
//! just the first, so callers can surface them per-field.
//!
//! Poem content rules (length, non-whitespace minimum) live in
//! [`PoemContent`], separate from the wire schema on purpose: an
//! `edit.content` field itself carries no length constraint.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Display-name length bounds (characters).
pub const USER_NAME_MIN_CHARS: usize = 1;
pub const USER_NAME_MAX_CHARS: usize = 50;

/// Poem content bounds (characters).
pub const CONTENT_MAX_CHARS: usize = 2000;
/// Minimum non-whitespace span a poem must carry once trimmed.
pub const CONTENT_MIN_TRIMMED_CHARS: usize = 10;

/// A single field-level schema violation: where, and what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Dotted path to the offending field (`cursor.userId`), empty for
    /// whole-value problems.
    pub path: String,
    pub message: String,
}

/// The full set of violations found while validating one value.
///
/// Validation never stops at the first problem; every bad field is
/// reported so the caller can map them onto form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaViolations(Vec<Violation>);

impl SchemaViolations {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        let mut v = Self::new();
        v.push(path, message);
        v
    }

    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(Violation {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.0
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.0
    }
}

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema validation failed")?;
        for (i, v) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            if v.path.is_empty() {
                write!(f, "{sep}{}", v.message)?;
            } else {
                write!(f, "{sep}{}: {}", v.path, v.message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SchemaViolations {}

/// One peer's caret position inside a poem draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CursorPosition {
    pub position: usize,
    pub user_id: Uuid,
    pub user_name: String,
}

/// One peer's selected span.
///
/// `end >= start` is deliberately not enforced; the range is rendered
/// as-is and a reversed range means a backwards drag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
    pub user_id: Uuid,
    pub user_name: String,
}

/// Tagged envelope for one collaborative-editing event.
///
/// `edit` carries the *full* replacement buffer; there is no diff or
/// patch format, and the last edit received wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CollaborationMessage {
    Edit { content: String },
    Cursor { cursor: CursorPosition },
    Selection { selection: SelectionRange },
    Join { poem_id: Uuid, user_id: Uuid },
    Leave { poem_id: Uuid, user_id: Uuid },
}

impl CollaborationMessage {
    /// The wire discriminator for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Edit { .. } => "edit",
            Self::Cursor { .. } => "cursor",
            Self::Selection { .. } => "selection",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
        }
    }

    /// The user that produced this message, where the shape carries one.
    ///
    /// `edit` is anonymous on the wire: it cannot be attributed, so it
    /// is fanned out to everyone including its own sender.
    pub fn sender_id(&self) -> Option<Uuid> {
        match self {
            Self::Edit { .. } => None,
            Self::Cursor { cursor } => Some(cursor.user_id),
            Self::Selection { selection } => Some(selection.user_id),
            Self::Join { user_id, .. } | Self::Leave { user_id, .. } => Some(*user_id),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse and validate a raw JSON frame.
    pub fn from_json(text: &str) -> Result<Self, SchemaViolations> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SchemaViolations::single("", format!("not valid JSON: {e}")))?;
        validate(&value)
    }
}

/// Validate an arbitrary JSON value against the closed message union.
///
/// Collects every violation (missing fields, bad bounds, malformed
/// UUIDs) before failing; only a zero-violation value is constructed.
pub fn validate(raw: &Value) -> Result<CollaborationMessage, SchemaViolations> {
    let obj = match raw.as_object() {
        Some(o) => o,
        None => return Err(SchemaViolations::single("", "expected a JSON object")),
    };

    let ty = match obj.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(_) => return Err(SchemaViolations::single("type", "discriminator must be a string")),
        None => return Err(SchemaViolations::single("type", "required field is missing")),
    };

    let mut v = SchemaViolations::new();
    match ty {
        "edit" => match obj.get("content") {
            Some(Value::String(_)) => {}
            Some(_) => v.push("content", "must be a string"),
            None => v.push("content", "required field is missing"),
        },
        "cursor" => {
            if let Some(c) = child_object(obj, "cursor", &mut v) {
                check_index(c, "position", "cursor.position", &mut v);
                check_uuid(c, "userId", "cursor.userId", &mut v);
                check_user_name(c, "userName", "cursor.userName", &mut v);
            }
        }
        "selection" => {
            if let Some(s) = child_object(obj, "selection", &mut v) {
                check_index(s, "start", "selection.start", &mut v);
                check_index(s, "end", "selection.end", &mut v);
                check_uuid(s, "userId", "selection.userId", &mut v);
                check_user_name(s, "userName", "selection.userName", &mut v);
            }
        }
        "join" | "leave" => {
            check_uuid(obj, "poemId", "poemId", &mut v);
            check_uuid(obj, "userId", "userId", &mut v);
        }
        other => {
            return Err(SchemaViolations::single(
                "type",
                format!("unknown message type `{other}`"),
            ))
        }
    }

    if !v.is_empty() {
        return Err(v);
    }

    // Field-level checks passed; serde failures here (e.g. unexpected
    // extra fields inside a payload struct) surface as one violation.
    serde_json::from_value(raw.clone()).map_err(|e| SchemaViolations::single("", e.to_string()))
}

fn child_object<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    v: &mut SchemaViolations,
) -> Option<&'a Map<String, Value>> {
    match obj.get(field) {
        Some(Value::Object(child)) => Some(child),
        Some(_) => {
            v.push(field, "must be an object");
            None
        }
        None => {
            v.push(field, "required field is missing");
            None
        }
    }
}

fn check_index(obj: &Map<String, Value>, field: &str, path: &str, v: &mut SchemaViolations) {
    match obj.get(field) {
        Some(Value::Number(n)) if n.as_u64().is_some() => {}
        Some(_) => v.push(path, "must be a non-negative integer"),
        None => v.push(path, "required field is missing"),
    }
}

fn check_uuid(obj: &Map<String, Value>, field: &str, path: &str, v: &mut SchemaViolations) {
    match obj.get(field) {
        Some(Value::String(s)) => {
            if Uuid::parse_str(s).is_err() {
                v.push(path, "must be a valid UUID");
            }
        }
        Some(_) => v.push(path, "must be a UUID string"),
        None => v.push(path, "required field is missing"),
    }
}

fn check_user_name(obj: &Map<String, Value>, field: &str, path: &str, v: &mut SchemaViolations) {
    match obj.get(field) {
        Some(Value::String(s)) => {
            let len = s.chars().count();
            if !(USER_NAME_MIN_CHARS..=USER_NAME_MAX_CHARS).contains(&len) {
                v.push(path, "must be 1-50 characters");
            }
        }
        Some(_) => v.push(path, "must be a string"),
        None => v.push(path, "required field is missing"),
    }
}

/// A poem draft body that passed the typing rules.
///
/// These rules gate what may be *sent* as an `edit`; they are not part
/// of the wire schema itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoemContent {
    pub content: String,
}

impl PoemContent {
    /// Validate a content string: non-empty, at most 2000 characters,
    /// and at least 10 characters once surrounding whitespace is trimmed.
    pub fn new(content: impl Into<String>) -> Result<Self, SchemaViolations> {
        let content = content.into();
        let mut v = SchemaViolations::new();
        let len = content.chars().count();
        if len == 0 {
            v.push("content", "content must not be empty");
        } else if len > CONTENT_MAX_CHARS {
            v.push("content", "content must be at most 2000 characters");
        } else if content.trim().chars().count() < CONTENT_MIN_TRIMMED_CHARS {
            v.push("content", "content needs at least 10 non-whitespace characters");
        }
        if v.is_empty() {
            Ok(Self { content })
        } else {
            Err(v)
        }
    }
}

/// Validate a raw `{ "content": … }` value.
///
/// Shape check first, then the [`PoemContent`] typing rules. The input
/// string is returned unchanged on success.
pub fn validate_content(raw: &Value) -> Result<PoemContent, SchemaViolations> {
    let obj = match raw.as_object() {
        Some(o) => o,
        None => return Err(SchemaViolations::single("", "expected a JSON object")),
    };
    match obj.get("content") {
        Some(Value::String(s)) => PoemContent::new(s.as_str()),
        Some(_) => Err(SchemaViolations::single("content", "must be a string")),
        None => Err(SchemaViolations::single("content", "required field is missing")),
    }
}
