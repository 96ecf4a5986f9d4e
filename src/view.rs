//! What the user-facing surface renders.
//!
//! The list is a plain snapshot of the session state plus the loading flag
//! and the placeholder text shown when it is empty. Form feedback separates
//! field-level validation messages from the single store error message.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::managers::session_manager::BookmarkSession;
use crate::types::bookmark::Bookmark;
use crate::types::errors::{SessionError, StoreError};
use crate::types::validation::Field;

/// Placeholder shown instead of an empty list.
pub const EMPTY_LIST_MESSAGE: &str = "No bookmarks yet. Add one above to get started.";

/// Shown when a delete fails without a usable message from the store.
pub const DELETE_FAILED_MESSAGE: &str = "An unexpected error occurred while deleting the bookmark.";

/// Rendered bookmark list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListView {
    pub loading: bool,
    pub bookmarks: Vec<Bookmark>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_message: Option<&'static str>,
}

impl ListView {
    pub fn new(loading: bool, bookmarks: Vec<Bookmark>) -> Self {
        let empty_message = (!loading && bookmarks.is_empty()).then_some(EMPTY_LIST_MESSAGE);
        Self {
            loading,
            bookmarks,
            empty_message,
        }
    }

    pub fn of(session: &BookmarkSession) -> Self {
        Self::new(session.is_loading(), session.snapshot())
    }
}

/// Feedback for the submission form after a failed submit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormFeedback {
    /// Inline messages keyed by field.
    pub fields: BTreeMap<Field, String>,
    /// Message shown above the form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&SessionError> for FormFeedback {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Validation(v) => Self {
                fields: v.result.errors.clone(),
                message: None,
            },
            SessionError::Store(e) => Self {
                fields: BTreeMap::new(),
                message: Some(e.to_string()),
            },
        }
    }
}

/// Message shown when deleting a row fails.
pub fn delete_failure_message(err: &StoreError) -> String {
    match err {
        StoreError::Backend(msg) | StoreError::DatabaseError(msg) if msg.trim().is_empty() => {
            DELETE_FAILED_MESSAGE.to_string()
        }
        other => other.to_string(),
    }
}
