//! (De)serialization helpers shared by the crosskeys crates.

pub mod base64;
mod canonical_json;

pub use self::canonical_json::{CanonicalJsonError, canonical_json};

/// An arbitrary JSON value.
pub type JsonValue = serde_json::Value;

/// Serializes a value to a JSON byte buffer.
pub fn json_to_buf<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}
