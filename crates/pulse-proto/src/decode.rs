//! Notification payload decoding.
//!
//! Payloads are JSON objects emitted by the database trigger:
//!
//! ```text
//! {"operation": "update", "table": "orders", "data": {"id": 42, ...}}
//! ```
//!
//! The row identity is taken from a top-level `id` field when present, and
//! from `data.id` otherwise. Strings are used verbatim and integers are
//! rendered in decimal; any other shape leaves the identity absent.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::event::{ChangeEvent, Operation};
use crate::ROW_ID_FIELD;

/// Decode a raw notification payload into a [`ChangeEvent`].
///
/// This is a pure function: it has no side effects and the same input always
/// yields the same result.
pub fn decode(raw: &[u8]) -> Result<ChangeEvent, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let operation: Operation = required_str(&fields, "operation")?.parse()?;

    let table = required_str(&fields, "table")?;
    if table.is_empty() {
        return Err(DecodeError::EmptyTable);
    }
    let table = table.to_string();

    let row_id = fields
        .get(ROW_ID_FIELD)
        .and_then(row_identity)
        .or_else(|| {
            fields
                .get("data")
                .and_then(|data| data.get(ROW_ID_FIELD))
                .and_then(row_identity)
        });

    let data = fields
        .remove("data")
        .ok_or(DecodeError::MissingField("data"))?;

    Ok(ChangeEvent {
        operation,
        table,
        row_id,
        data,
    })
}

fn required_str<'a>(
    fields: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, DecodeError> {
    match fields.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(DecodeError::InvalidField {
            field,
            expected: "string",
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn row_identity(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}
