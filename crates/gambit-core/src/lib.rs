//! Gambit Core - shared types, saved state, errors, schema contract, and
//! the parent/worker wire vocabulary

pub mod error;
pub mod protocol;
pub mod schema;
pub mod state;
pub mod types;

pub use error::{Error, ErrorPayload, Result};
pub use schema::{normalize_json_schema, Schema, SchemaError};
pub use state::{derive_messages, ContentPart, ResponseItem, SavedState};
pub use types::*;
