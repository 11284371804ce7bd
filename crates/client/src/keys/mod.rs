//! Runtime key objects: per-device keys and cross-signing keys, together
//! with the local trust state attached to them.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::core::encryption::{KeyUsage, Signatures};
use crate::core::serde::CanonicalJsonError;
use crate::core::signatures::{SignatureVerifier, signable_json};
use crate::core::{
    DeviceKeyAlgorithm, DeviceKeyId, JsonValue, OwnedDeviceKeyId, OwnedUserId, UserId,
};

mod cross_signing;
mod device;

pub use self::cross_signing::CrossSigningKey;
pub use self::device::DeviceKey;

/// Memoized results of earlier signature verifications on a key, keyed by
/// the signing user and the full signing key ID.
///
/// The cache is monotone: a result, once recorded, is never invalidated,
/// because the verified triple of signing content, signer public key and
/// signature is immutable for as long as the key object exists. It is never
/// persisted.
#[derive(Debug, Default)]
pub struct SignatureCache(Mutex<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, bool>>>);

impl SignatureCache {
    pub fn get(&self, signer: &UserId, key_id: &DeviceKeyId) -> Option<bool> {
        let cache = self.0.lock().unwrap();
        cache.get(signer)?.get(key_id).copied()
    }

    pub fn insert(&self, signer: &UserId, key_id: &DeviceKeyId, valid: bool) {
        self.0
            .lock()
            .unwrap()
            .entry(signer.to_owned())
            .or_default()
            .insert(key_id.to_owned(), valid);
    }
}

/// The common contract of device keys and cross-signing keys.
pub trait SignableKey {
    /// The user this key belongs to.
    fn user_id(&self) -> &UserId;

    /// The key's local identifier: the device ID for device keys, the
    /// public key for cross-signing keys. Absent for malformed uploads; a
    /// key without an identifier is never valid.
    fn identifier(&self) -> Option<&str>;

    /// The upstream JSON form of the key, as received. This is the source
    /// of truth for the signing input.
    fn content(&self) -> &JsonValue;

    /// Public key material, keyed by `<algorithm>:<identifier>`.
    fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String>;

    /// Signatures over this key.
    fn signatures(&self) -> &Signatures;

    /// Whether the local user has directly verified this key.
    fn direct_verified(&self) -> bool;

    /// The raw local block flag, without the self-signature rule applied.
    fn blocked_flag(&self) -> bool;

    /// Role labels; empty for device keys.
    fn usage(&self) -> &[KeyUsage] {
        &[]
    }

    /// The memoized signature verification results of this key.
    fn signature_cache(&self) -> &SignatureCache;

    /// The Ed25519 public key material of this key, or absent.
    fn ed25519_key(&self) -> Option<&str> {
        let identifier = self.identifier()?;
        self.keys()
            .get(&DeviceKeyId::from_parts(
                DeviceKeyAlgorithm::Ed25519,
                identifier,
            ))
            .map(String::as_str)
    }

    /// The canonical byte sequence signatures of this key are computed
    /// over.
    fn signing_content(&self) -> Result<String, CanonicalJsonError> {
        signable_json(self.content())
    }
}

/// A device or cross-signing key resolved from the directory.
#[derive(Clone, Copy, Debug)]
pub enum KeyRef<'a> {
    Device(&'a DeviceKey),
    CrossSigning(&'a CrossSigningKey),
}

impl KeyRef<'_> {
    /// Whether the underlying upload is usable at all.
    pub fn is_valid(self, verifier: &dyn SignatureVerifier) -> bool {
        match self {
            Self::Device(key) => key.is_valid(verifier),
            Self::CrossSigning(key) => key.is_valid(),
        }
    }

    /// Effective block state; a device that fails its own self-signature
    /// is blocked regardless of the local flag.
    pub fn blocked(self, verifier: &dyn SignatureVerifier) -> bool {
        match self {
            Self::Device(key) => key.blocked(verifier),
            Self::CrossSigning(key) => key.blocked(),
        }
    }

    /// Whether this is a cross-signing key carrying the `master` role.
    pub fn is_master(self) -> bool {
        matches!(self, Self::CrossSigning(key) if key.usage().contains(&KeyUsage::Master))
    }
}

impl SignableKey for KeyRef<'_> {
    fn user_id(&self) -> &UserId {
        match self {
            Self::Device(key) => key.user_id(),
            Self::CrossSigning(key) => key.user_id(),
        }
    }

    fn identifier(&self) -> Option<&str> {
        match self {
            Self::Device(key) => key.identifier(),
            Self::CrossSigning(key) => key.identifier(),
        }
    }

    fn content(&self) -> &JsonValue {
        match self {
            Self::Device(key) => key.content(),
            Self::CrossSigning(key) => key.content(),
        }
    }

    fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        match self {
            Self::Device(key) => key.keys(),
            Self::CrossSigning(key) => key.keys(),
        }
    }

    fn signatures(&self) -> &Signatures {
        match self {
            Self::Device(key) => key.signatures(),
            Self::CrossSigning(key) => key.signatures(),
        }
    }

    fn direct_verified(&self) -> bool {
        match self {
            Self::Device(key) => key.direct_verified(),
            Self::CrossSigning(key) => key.direct_verified(),
        }
    }

    fn blocked_flag(&self) -> bool {
        match self {
            Self::Device(key) => key.blocked_flag(),
            Self::CrossSigning(key) => key.blocked_flag(),
        }
    }

    fn usage(&self) -> &[KeyUsage] {
        match self {
            Self::Device(key) => key.usage(),
            Self::CrossSigning(key) => key.usage(),
        }
    }

    fn signature_cache(&self) -> &SignatureCache {
        match self {
            Self::Device(key) => key.signature_cache(),
            Self::CrossSigning(key) => key.signature_cache(),
        }
    }
}
