//! Narrow JSON-column codec contract shared by every payload column in the schema.
//!
//! Rules: `None`/nil-ish values encode to SQL NULL, never the string `"null"`. NULL
//! or whitespace-only TEXT decodes to `None`. Empty collections are preserved as
//! their empty JSON form (`{}`, `[]`) and are not conflated with NULL.
use crate::errors::RepositoryError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload type that can be validated after decoding, e.g. `UsageSummary`'s
/// "JSON array" DB-level check.
pub trait Validate {
    fn validate(&self) -> Result<(), RepositoryError>;
}

/// Encode an optional value to its SQL-NULL-or-JSON-TEXT representation.
pub fn encode_optional<T: Serialize>(value: &Option<T>) -> Result<Option<String>, RepositoryError> {
    match value {
        None => Ok(None),
        Some(v) => serde_json::to_string(v)
            .map(Some)
            .map_err(|e| RepositoryError::Validation(format!("failed to encode JSON column: {e}"))),
    }
}

/// Decode a TEXT column into an optional validated value, per the NULL/blank → None
/// rule and the empty-container-preserved rule.
pub fn decode_optional<T: DeserializeOwned + Validate>(
    raw: Option<String>,
) -> Result<Option<T>, RepositoryError> {
    let Some(text) = raw else { return Ok(None) };
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value: T = serde_json::from_str(&text)
        .map_err(|e| RepositoryError::Validation(format!("failed to decode JSON column: {e}")))?;
    value.validate()?;
    Ok(Some(value))
}

/// Decode a TEXT column into an optional, unvalidated `serde_json::Value` — used for
/// the generic `input`/`output`/`error` payload columns, which carry no schema of
/// their own.
pub fn decode_optional_value(raw: Option<String>) -> Result<Option<serde_json::Value>, RepositoryError> {
    let Some(text) = raw else { return Ok(None) };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| RepositoryError::Validation(format!("failed to decode JSON column: {e}")))
}

/// Encode an optional `serde_json::Value`, preserving the nil-ish → NULL rule:
/// `Value::Null` itself still encodes to the literal JSON `null`, since an explicit
/// `Value::Null` is a caller-supplied payload, not an absent one.
pub fn encode_optional_value(value: &Option<serde_json::Value>) -> Result<Option<String>, RepositoryError> {
    encode_optional(value)
}
