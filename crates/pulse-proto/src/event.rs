//! Change event types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Types of row-level changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A new row was inserted.
    Insert,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl Operation {
    /// Get the lowercase wire name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("insert") {
            Ok(Operation::Insert)
        } else if s.eq_ignore_ascii_case("update") {
            Ok(Operation::Update)
        } else if s.eq_ignore_ascii_case("delete") {
            Ok(Operation::Delete)
        } else {
            Err(DecodeError::UnknownOperation(s.to_string()))
        }
    }
}

/// A single row-level change.
///
/// Built once by the decoder and never mutated afterwards. `data` holds the
/// new row image for inserts and updates, and the old row image for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The kind of change.
    pub operation: Operation,
    /// The table the row belongs to.
    pub table: String,
    /// Row identity, when the payload exposes a recognizable one.
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<String>,
    /// The affected row's fields.
    pub data: Value,
}

impl ChangeEvent {
    /// Create a new change event.
    pub fn new(operation: Operation, table: impl Into<String>, data: Value) -> Self {
        Self {
            operation,
            table: table.into(),
            row_id: None,
            data,
        }
    }

    /// Set the row identity.
    pub fn with_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    /// Encode this event in the text form sent to subscribers.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
