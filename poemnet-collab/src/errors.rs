//! Uniform error surface for the poem editor UI.
//!
//! Failures reaching the UI fall into four kinds, and recovery differs
//! per kind: `validation` blocks the save and maps onto form fields,
//! `network` asks the user to check their connection, `collaboration`
//! warns that peer sync may be stale, `unknown` covers anything
//! uncaught. Classifiers never panic and never leak transport
//! internals into the displayed message; details go to the log.

use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use crate::message::validate_content;

/// Failure taxonomy the UI keys recovery behavior on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Network,
    Collaboration,
    Unknown,
}

/// One displayable editor failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorError {
    pub message: String,
    /// Field the failure maps onto, for validation errors.
    pub field: Option<String>,
    pub kind: ErrorKind,
}

/// Run content validation and map the outcome to displayable errors.
///
/// Always returns a list: empty on success, one entry per field
/// violation, or a single `unknown` entry if validation itself blew up.
pub fn classify_content_error(raw: &Value) -> Vec<EditorError> {
    match catch_unwind(AssertUnwindSafe(|| validate_content(raw))) {
        Ok(Ok(_)) => Vec::new(),
        Ok(Err(violations)) => violations
            .into_violations()
            .into_iter()
            .map(|v| EditorError {
                message: v.message,
                field: Some(v.path),
                kind: ErrorKind::Validation,
            })
            .collect(),
        Err(_) => {
            log::error!("content validation panicked");
            vec![EditorError {
                message: "unexpected validation error".into(),
                field: None,
                kind: ErrorKind::Unknown,
            }]
        }
    }
}

/// Wrap a transport failure for display. Deliberately generic.
pub fn classify_network_failure(err: &dyn Error) -> EditorError {
    log::warn!("network failure: {err}");
    EditorError {
        message: "connection check advised".into(),
        field: None,
        kind: ErrorKind::Network,
    }
}

/// Wrap a channel publish/subscribe failure for display.
pub fn classify_collaboration_failure(err: &dyn Error) -> EditorError {
    log::warn!("collaboration failure: {err}");
    EditorError {
        message: "peer sync may be stale".into(),
        field: None,
        kind: ErrorKind::Collaboration,
    }
}

/// Accumulated editor errors for one editing view.
#[derive(Debug, Default)]
pub struct EditorErrors {
    errors: Vec<EditorError>,
}

impl EditorErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate draft content, recording any failures. Returns whether
    /// the draft is clean.
    pub fn record_content(&mut self, raw: &Value) -> bool {
        let errs = classify_content_error(raw);
        let ok = errs.is_empty();
        self.errors.extend(errs);
        ok
    }

    pub fn record_network(&mut self, err: &dyn Error) {
        self.errors.push(classify_network_failure(err));
    }

    pub fn record_collaboration(&mut self, err: &dyn Error) {
        self.errors.push(classify_collaboration_failure(err));
    }

    /// Reset to empty. Idempotent.
    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// First error recorded against a given field, if any.
    pub fn field_error(&self, field: &str) -> Option<&EditorError> {
        self.errors.iter().find(|e| e.field.as_deref() == Some(field))
    }

    pub fn all(&self) -> &[EditorError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use serde_json::json;

    #[test]
    fn test_short_content_yields_one_validation_error() {
        let errs = classify_content_error(&json!({ "content": "  five  " }));
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::Validation);
        assert_eq!(errs[0].field.as_deref(), Some("content"));
    }

    #[test]
    fn test_valid_content_yields_empty_list() {
        let errs = classify_content_error(&json!({ "content": "a poem long enough to pass" }));
        assert!(errs.is_empty());
    }

    #[test]
    fn test_missing_content_is_validation_not_unknown() {
        let errs = classify_content_error(&json!({}));
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::Validation);
    }

    #[test]
    fn test_network_failure_message_is_generic() {
        let err = ChannelError::Publish("ECONNRESET deep in the stack".into());
        let e = classify_network_failure(&err);
        assert_eq!(e.kind, ErrorKind::Network);
        assert_eq!(e.message, "connection check advised");
        assert!(e.field.is_none());
    }

    #[test]
    fn test_collaboration_failure_message() {
        let err = ChannelError::Publish("lagged".into());
        let e = classify_collaboration_failure(&err);
        assert_eq!(e.kind, ErrorKind::Collaboration);
        assert_eq!(e.message, "peer sync may be stale");
    }

    #[test]
    fn test_accumulator_record_and_clear() {
        let mut errors = EditorErrors::new();
        assert!(errors.is_empty());

        assert!(!errors.record_content(&json!({ "content": "tiny" })));
        assert_eq!(errors.len(), 1);

        errors.clear();
        assert!(errors.is_empty());
        errors.clear(); // idempotent
        assert!(errors.is_empty());
    }

    #[test]
    fn test_field_error_first_match() {
        let mut errors = EditorErrors::new();
        errors.record_content(&json!({ "content": "" }));
        let err = ChannelError::Publish("x".into());
        errors.record_network(&err);

        let field = errors.field_error("content").unwrap();
        assert_eq!(field.kind, ErrorKind::Validation);
        assert!(errors.field_error("title").is_none());
    }

    #[test]
    fn test_record_content_ok_records_nothing() {
        let mut errors = EditorErrors::new();
        assert!(errors.record_content(&json!({ "content": "plenty of words in this draft" })));
        assert!(errors.is_empty());
    }
}
