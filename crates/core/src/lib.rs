//! Core library used by the crosskeys crates.
//!
//! This crate carries the protocol-level building blocks that the trust
//! evaluation runtime is built on: opaque identifier types, the lenient
//! wire shapes of device and cross-signing keys, canonical JSON, and
//! Ed25519 signature verification.

pub mod encryption;
pub mod identifiers;
pub mod serde;
pub mod signatures;
mod time;

pub use self::identifiers::*;
pub use self::serde::JsonValue;
pub use self::time::UnixMillis;
