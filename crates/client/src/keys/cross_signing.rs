use std::collections::BTreeMap;

use crate::core::encryption::{CrossSigningKeys, KeyUsage, Signatures};
use crate::core::{JsonValue, OwnedDeviceKeyId, UserId};

use super::{SignableKey, SignatureCache};

/// A cross-signing key of some user, together with the local trust state
/// the user attached to it.
///
/// Cross-signing keys carry no self-signature requirement; they are
/// anchored by the user directly verifying them, or by a signature from the
/// user's master key.
#[derive(Debug)]
pub struct CrossSigningKey {
    content: JsonValue,
    cross_signing_keys: CrossSigningKeys,
    verified: bool,
    blocked: bool,
    signature_cache: SignatureCache,
}

impl CrossSigningKey {
    /// Builds a cross-signing key from its upstream JSON form.
    pub fn from_json(content: JsonValue) -> Result<Self, serde_json::Error> {
        let cross_signing_keys: CrossSigningKeys = serde_json::from_value(content.clone())?;
        Ok(Self {
            content,
            cross_signing_keys,
            verified: false,
            blocked: false,
            signature_cache: SignatureCache::default(),
        })
    }

    /// The public key this cross-signing key is identified by.
    pub fn public_key(&self) -> Option<&str> {
        self.cross_signing_keys.public_key()
    }

    /// The block flag. Cross-signing keys have no additional block rule
    /// beyond the local flag.
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    /// Whether the upload is usable at all: owning user, public key and
    /// Ed25519 material present.
    pub fn is_valid(&self) -> bool {
        !self.user_id().as_str().is_empty()
            && self.public_key().is_some()
            && !self.cross_signing_keys.keys.is_empty()
            && self.ed25519_key().is_some()
    }

    pub(crate) fn set_verified_flag(&mut self, verified: bool) {
        self.verified = verified;
    }

    pub(crate) fn set_blocked_flag(&mut self, blocked: bool) {
        self.blocked = blocked;
    }
}

impl SignableKey for CrossSigningKey {
    fn user_id(&self) -> &UserId {
        &self.cross_signing_keys.user_id
    }

    fn identifier(&self) -> Option<&str> {
        self.public_key()
    }

    fn content(&self) -> &JsonValue {
        &self.content
    }

    fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        &self.cross_signing_keys.keys
    }

    fn signatures(&self) -> &Signatures {
        &self.cross_signing_keys.signatures
    }

    fn direct_verified(&self) -> bool {
        self.verified
    }

    fn blocked_flag(&self) -> bool {
        self.blocked
    }

    fn usage(&self) -> &[KeyUsage] {
        &self.cross_signing_keys.usage
    }

    fn signature_cache(&self) -> &SignatureCache {
        &self.signature_cache
    }
}

impl PartialEq for CrossSigningKey {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.identifier() == other.identifier()
    }
}
