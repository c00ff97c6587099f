//! Pulse change event types and payload decoding.
//!
//! This crate defines the event model shared by the Pulse server: the
//! [`ChangeEvent`] produced for every row-level mutation and the decoder
//! that turns a raw notification payload into one.
//!
//! # Modules
//!
//! - [`event`] - Change event and operation types, plus the wire encoding
//! - [`decode`] - Notification payload decoder
//! - [`error`] - Decode error types
//!
//! # Example
//!
//! ```
//! use pulse_proto::{decode, Operation};
//!
//! let raw = br#"{"operation":"update","table":"orders","data":{"id":42,"total":10}}"#;
//! let event = decode(raw).unwrap();
//!
//! assert_eq!(event.operation, Operation::Update);
//! assert_eq!(event.table, "orders");
//! assert_eq!(event.row_id.as_deref(), Some("42"));
//! ```

pub mod decode;
pub mod error;
pub mod event;

pub use decode::decode;
pub use error::DecodeError;
pub use event::{ChangeEvent, Operation};

/// Name of the row-identity field looked up in notification payloads.
pub const ROW_ID_FIELD: &str = "id";
