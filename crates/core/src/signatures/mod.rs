//! Digital signatures over key objects.
//!
//! Device keys and cross-signing keys are signed over the canonical JSON
//! form of their public attributes. The signatures are stored within the
//! JSON object itself under a `signatures` key, as base64-encoded strings
//! using the standard character set, without padding.
//!
//! Local bookkeeping flags (`verified`, `blocked`) are sometimes embedded
//! in legacy serializations of a key and must never perturb the signing
//! input; [`signable_json`] strips them together with the `unsigned` and
//! `signatures` fields before producing the canonical byte sequence.
//!
//! Verification itself is behind the [`SignatureVerifier`] trait so that a
//! runtime without a working Ed25519 primitive is representable: such a
//! verifier answers [`Verification::Unavailable`] and the caller decides
//! per call site whether that counts as success or failure.

use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};

use crate::serde::{CanonicalJsonError, JsonValue, base64, canonical_json};

/// Fields that never contribute to a key's signing input.
const UNSIGNABLE_FIELDS: &[&str] = &["verified", "blocked", "unsigned", "signatures"];

/// Produces the canonical byte sequence a key object is signed over.
///
/// The `verified`, `blocked`, `unsigned` and `signatures` fields are
/// removed before canonical encoding; the output is byte-identical
/// regardless of their presence in the input.
pub fn signable_json(value: &JsonValue) -> Result<String, CanonicalJsonError> {
    let mut value = value.clone();
    if let Some(object) = value.as_object_mut() {
        for field in UNSIGNABLE_FIELDS {
            object.remove(*field);
        }
    }
    canonical_json(&value)
}

/// The outcome of a signature check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    /// The signature is valid.
    Valid,

    /// The signature is invalid, or the key or signature material could not
    /// be decoded.
    Invalid,

    /// The cryptographic primitive is not available in this runtime.
    Unavailable,
}

impl Verification {
    /// Whether the check positively succeeded.
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Checks detached Ed25519 signatures.
///
/// Key and signature are unpadded standard base64; the message is the raw
/// canonical byte sequence.
pub trait SignatureVerifier: Send + Sync {
    fn verify_ed25519(&self, public_key: &str, message: &[u8], signature: &str) -> Verification;
}

/// A [`SignatureVerifier`] backed by the bundled Ed25519 primitive.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify_ed25519(&self, public_key: &str, message: &[u8], signature: &str) -> Verification {
        // One verifying key per call; it is released on every exit path.
        let Some(key_bytes) = base64::decode(public_key) else {
            return Verification::Invalid;
        };
        let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return Verification::Invalid;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return Verification::Invalid;
        };

        let Some(signature_bytes) = base64::decode(signature) else {
            return Verification::Invalid;
        };
        let Ok(signature_bytes) = <[u8; 64]>::try_from(signature_bytes.as_slice()) else {
            return Verification::Invalid;
        };
        let signature = Signature::from_bytes(&signature_bytes);

        match key.verify(message, &signature) {
            Ok(()) => Verification::Valid,
            Err(_) => Verification::Invalid,
        }
    }
}

/// A [`SignatureVerifier`] standing in when the cryptographic primitive
/// cannot be loaded; every check answers [`Verification::Unavailable`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableVerifier;

impl SignatureVerifier for UnavailableVerifier {
    fn verify_ed25519(&self, _public_key: &str, _message: &[u8], _signature: &str) -> Verification {
        Verification::Unavailable
    }
}
