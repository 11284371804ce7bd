use serde_json::Value as JsonValue;
use thiserror::Error;

/// The largest integer magnitude representable in canonical JSON.
const MAX_CANONICAL_INT: i64 = (1 << 53) - 1;

/// Errors that can happen when producing the canonical form of a JSON value.
#[derive(Error, Debug)]
pub enum CanonicalJsonError {
    /// Floats have no canonical encoding.
    #[error("floats cannot be canonically encoded")]
    Float,

    /// Integers must fit into the `[-(2^53 - 1), 2^53 - 1]` range.
    #[error("integer `{0}` outside the canonical range")]
    IntegerOutOfRange(String),

    #[error("serde json: `{0}`")]
    SerdeJson(#[from] serde_json::Error),
}

/// Serializes a JSON value into its canonical form: object keys sorted by
/// UTF-8 byte order, no insignificant whitespace, raw UTF-8 output and
/// minimally encoded integers.
///
/// The output is byte-deterministic and independent of the order in which
/// the value's objects were built, which makes it suitable as a signing
/// input.
pub fn canonical_json(value: &JsonValue) -> Result<String, CanonicalJsonError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut String, value: &JsonValue) -> Result<(), CanonicalJsonError> {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(true) => out.push_str("true"),
        JsonValue::Bool(false) => out.push_str("false"),
        JsonValue::Number(number) => {
            if let Some(int) = number.as_i64() {
                if !(-MAX_CANONICAL_INT..=MAX_CANONICAL_INT).contains(&int) {
                    return Err(CanonicalJsonError::IntegerOutOfRange(number.to_string()));
                }
                out.push_str(&int.to_string());
            } else if number.is_u64() {
                return Err(CanonicalJsonError::IntegerOutOfRange(number.to_string()));
            } else {
                return Err(CanonicalJsonError::Float);
            }
        }
        JsonValue::String(s) => out.push_str(&serde_json::to_string(s)?),
        JsonValue::Array(values) => {
            out.push('[');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, value)?;
            }
            out.push(']');
        }
        JsonValue::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, &object[key])?;
            }
            out.push('}');
        }
    }
    Ok(())
}
