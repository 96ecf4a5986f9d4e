//! Bookmark input validation.
//!
//! Runs before any store call. Pure: no network check, no duplicate check.

use std::collections::BTreeMap;

use url::Url;

use crate::types::errors::ValidationError;
use crate::types::validation::{Field, ValidationResult};

pub const TITLE_EMPTY_MESSAGE: &str = "Title cannot be empty";
pub const URL_INVALID_MESSAGE: &str = "Please enter a valid URL";

/// Checks a candidate submission and reports every failing field at once.
pub fn validate_bookmark_input(url: &str, title: &str) -> ValidationResult {
    let mut errors = BTreeMap::new();

    if title.trim().is_empty() {
        errors.insert(Field::Title, TITLE_EMPTY_MESSAGE.to_string());
    }

    if !is_absolute_url(url) {
        errors.insert(Field::Url, URL_INVALID_MESSAGE.to_string());
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

/// Same check as [`validate_bookmark_input`], as a `Result` for `?` callers.
pub fn ensure_valid(url: &str, title: &str) -> Result<(), ValidationError> {
    let result = validate_bookmark_input(url, title);
    if result.valid {
        Ok(())
    } else {
        Err(ValidationError { result })
    }
}

// Scheme plus a non-empty authority. `mailto:` and `file:///` style URLs parse
// but carry no host, so they are rejected.
fn is_absolute_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(parsed) => !parsed.cannot_be_a_base() && parsed.host_str().map_or(false, |h| !h.is_empty()),
        Err(_) => false,
    }
}
