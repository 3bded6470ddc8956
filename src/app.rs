//! Identified applications.
//!
//! The identity/session collaborator proves control of an app's access token
//! and hands the core an [`IdentifiedApp`]. The core never re-validates it.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Opaque identifier assigned to a registered application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub u64);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A session that has proven control of a registered application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedApp {
    /// Registration id.
    pub id: AppId,
    /// Human-chosen unique name, e.g. `io.example.notes`.
    pub identifier: String,
    /// Whether the app supplied callbacks the hub may invoke.
    pub is_remote: bool,
}

impl IdentifiedApp {
    /// Creates an identified app record.
    #[must_use]
    pub fn new(id: AppId, identifier: impl Into<String>, is_remote: bool) -> Self {
        Self {
            id,
            identifier: identifier.into(),
            is_remote,
        }
    }
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("identifier regex is valid")
    })
}

/// Validates an app identifier, collection name or placeholder name.
///
/// Accepts ASCII letters, digits, `_`, `.` and `-`, not starting with a digit,
/// `.` or `-`.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    if !identifier_regex().is_match(value) {
        return Err(ValidationError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
