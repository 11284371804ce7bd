//! Cross-signing trust evaluation for end-to-end encrypted clients.
//!
//! The crate answers one question: is a given Ed25519 key, belonging to any
//! user the client knows about, currently trusted? Trusted keys are suitable
//! for encrypting message payloads to, and for attesting other keys.
//!
//! The [`KeyDirectory`] holds every known user's [`UserKeys`] bundle, which
//! in turn owns that user's [`DeviceKey`]s and [`CrossSigningKey`]s. Trust
//! between keys is never expressed as references between key objects;
//! signatures are resolved by `(user, key id)` lookups against the
//! directory, and a recursive chain walk decides whether a key is anchored
//! by something the local user has directly verified.
//!
//! Persistence, the network, the interactive verification session machine
//! and the Ed25519 primitive are all external collaborators behind the
//! [`KeyStore`], [`VerificationBackend`], [`CrossSigningDelegate`] and
//! [`core::signatures::SignatureVerifier`] traits.

pub use crosskeys_core as core;

pub mod config;
pub mod directory;
pub mod error;
pub mod keys;
pub mod signing;
pub mod store;
pub mod user;
pub mod verification;

pub use self::config::EncryptionConfig;
pub use self::directory::KeyDirectory;
pub use self::error::{Error, Result};
pub use self::keys::{CrossSigningKey, DeviceKey, KeyRef, SignableKey, SignatureCache};
pub use self::signing::{CrossSigningDelegate, NoCrossSigning, SigningTarget};
pub use self::store::{
    CrossSigningKeyRecord, DeviceKeyRecord, KeyStore, MemoryStore, StoreError, UserRecord,
};
pub use self::user::{UserKeys, UserVerifiedStatus};
pub use self::verification::{NewVerification, VerificationBackend, VerificationHandle};
