//! Decode error types.

use thiserror::Error;

/// Errors produced while decoding a notification payload.
///
/// A payload that fails to decode will never become valid, so callers log
/// and discard it rather than retrying.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not valid UTF-8 JSON.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload parsed but is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,

    /// A required field is missing.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A required field has the wrong type.
    #[error("field `{field}` must be a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    /// The operation is not insert, update or delete.
    #[error("unknown operation: {0:?}")]
    UnknownOperation(String),

    /// The table name is empty.
    #[error("table name is empty")]
    EmptyTable,
}
