use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::core::encryption::{DeviceKeys, EventEncryptionAlgorithm, Signatures};
use crate::core::signatures::{SignatureVerifier, Verification};
use crate::core::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, JsonValue, OwnedDeviceKeyId, UnixMillis, UserId,
};

use super::{SignableKey, SignatureCache};

/// A single device of some user, together with the local trust state the
/// user attached to it.
#[derive(Debug)]
pub struct DeviceKey {
    content: JsonValue,
    device_keys: DeviceKeys,
    verified: bool,
    blocked: bool,
    last_active: UnixMillis,
    self_signed: OnceLock<bool>,
    signature_cache: SignatureCache,
}

impl DeviceKey {
    /// Builds a device key from its upstream JSON form.
    pub fn from_json(content: JsonValue) -> Result<Self, serde_json::Error> {
        let device_keys: DeviceKeys = serde_json::from_value(content.clone())?;
        Ok(Self {
            content,
            device_keys,
            verified: false,
            blocked: false,
            last_active: UnixMillis::default(),
            self_signed: OnceLock::new(),
            signature_cache: SignatureCache::default(),
        })
    }

    /// The ID of the device, if the upload carried one.
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_keys.device_id.as_deref()
    }

    /// The encryption algorithms the device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.device_keys.algorithms
    }

    /// The device's Curve25519 companion key, used for session
    /// establishment.
    pub fn curve25519_key(&self) -> Option<&str> {
        self.device_keys.get_key(DeviceKeyAlgorithm::Curve25519)
    }

    /// The display name which the user set on the device.
    pub fn display_name(&self) -> Option<&str> {
        self.device_keys.unsigned.device_display_name.as_deref()
    }

    /// When the device was last seen active.
    pub fn last_active(&self) -> UnixMillis {
        self.last_active
    }

    pub(crate) fn set_last_active(&mut self, when: UnixMillis) {
        self.last_active = when;
    }

    /// Whether the device carries a valid signature by itself over its
    /// canonical form. Computed once, then memoized.
    ///
    /// An unavailable verifier counts as success here, so that new devices
    /// remain loadable while the primitive is not loaded; full trust still
    /// requires chain validation.
    pub fn self_signed(&self, verifier: &dyn SignatureVerifier) -> bool {
        *self
            .self_signed
            .get_or_init(|| self.check_self_signature(verifier))
    }

    fn check_self_signature(&self, verifier: &dyn SignatureVerifier) -> bool {
        let Some(device_id) = self.device_keys.device_id.as_deref() else {
            return false;
        };
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id);
        let Some(signature) = self
            .device_keys
            .signatures
            .get(self.user_id())
            .and_then(|signatures| signatures.get(&key_id))
        else {
            return false;
        };
        let Some(public_key) = self.ed25519_key() else {
            return false;
        };
        let Ok(message) = self.signing_content() else {
            return false;
        };
        match verifier.verify_ed25519(public_key, message.as_bytes(), signature) {
            Verification::Valid | Verification::Unavailable => true,
            Verification::Invalid => false,
        }
    }

    /// Effective block state: a device that fails its own self-signature is
    /// untrusted regardless of the local flag.
    pub fn blocked(&self, verifier: &dyn SignatureVerifier) -> bool {
        self.blocked || !self.self_signed(verifier)
    }

    /// Whether the upload is usable at all: device ID and both identity
    /// keys present, and the self-signature checks out.
    pub fn is_valid(&self, verifier: &dyn SignatureVerifier) -> bool {
        self.device_keys.device_id.is_some()
            && !self.device_keys.keys.is_empty()
            && self.curve25519_key().is_some()
            && self.ed25519_key().is_some()
            && self.self_signed(verifier)
    }

    pub(crate) fn set_verified_flag(&mut self, verified: bool) {
        self.verified = verified;
    }

    pub(crate) fn set_blocked_flag(&mut self, blocked: bool) {
        self.blocked = blocked;
    }
}

impl SignableKey for DeviceKey {
    fn user_id(&self) -> &UserId {
        &self.device_keys.user_id
    }

    fn identifier(&self) -> Option<&str> {
        self.device_keys.device_id.as_deref().map(DeviceId::as_str)
    }

    fn content(&self) -> &JsonValue {
        &self.content
    }

    fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        &self.device_keys.keys
    }

    fn signatures(&self) -> &Signatures {
        &self.device_keys.signatures
    }

    fn direct_verified(&self) -> bool {
        self.verified
    }

    fn blocked_flag(&self) -> bool {
        self.blocked
    }

    fn signature_cache(&self) -> &SignatureCache {
        &self.signature_cache
    }
}

impl PartialEq for DeviceKey {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.identifier() == other.identifier()
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer as _, SigningKey};
    use serde_json::json;

    use super::{DeviceKey, SignableKey};
    use crate::core::serde::base64;
    use crate::core::signatures::{Ed25519Verifier, UnavailableVerifier, signable_json};

    fn signed_device_json(seed: u8) -> serde_json::Value {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let public_key = base64::encode(signing_key.verifying_key().to_bytes());

        let mut content = json!({
            "user_id": "@alice:example.org",
            "device_id": "JLAFKJWSCS",
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                "curve25519:JLAFKJWSCS": "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4",
                "ed25519:JLAFKJWSCS": public_key,
            },
        });
        let message = signable_json(&content).unwrap();
        let signature = base64::encode(signing_key.sign(message.as_bytes()).to_bytes());
        content["signatures"] = json!({
            "@alice:example.org": { "ed25519:JLAFKJWSCS": signature }
        });
        content
    }

    #[test]
    fn valid_self_signed_device() {
        let device = DeviceKey::from_json(signed_device_json(1)).unwrap();

        assert!(device.self_signed(&Ed25519Verifier));
        assert!(device.is_valid(&Ed25519Verifier));
        assert!(!device.blocked(&Ed25519Verifier));
        assert_eq!(device.identifier(), Some("JLAFKJWSCS"));
        assert!(device.curve25519_key().is_some());
    }

    #[test]
    fn missing_self_signature_blocks_the_device() {
        let content = json!({
            "user_id": "@alice:example.org",
            "device_id": "JLAFKJWSCS",
            "keys": {
                "curve25519:JLAFKJWSCS": "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4",
                "ed25519:JLAFKJWSCS": "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4",
            },
        });
        let device = DeviceKey::from_json(content).unwrap();

        assert!(!device.self_signed(&Ed25519Verifier));
        assert!(!device.is_valid(&Ed25519Verifier));
        assert!(device.blocked(&Ed25519Verifier));
    }

    #[test]
    fn tampered_self_signature_is_rejected() {
        let mut content = signed_device_json(1);
        content["keys"]["curve25519:JLAFKJWSCS"] = "changed".into();
        let device = DeviceKey::from_json(content).unwrap();

        assert!(!device.self_signed(&Ed25519Verifier));
    }

    #[test]
    fn unavailable_verifier_accepts_present_self_signature() {
        let device = DeviceKey::from_json(signed_device_json(1)).unwrap();

        assert!(device.self_signed(&UnavailableVerifier));
        assert!(device.is_valid(&UnavailableVerifier));
    }

    #[test]
    fn unavailable_verifier_still_requires_a_signature() {
        let content = json!({
            "user_id": "@alice:example.org",
            "device_id": "JLAFKJWSCS",
            "keys": {
                "curve25519:JLAFKJWSCS": "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4",
                "ed25519:JLAFKJWSCS": "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4",
            },
        });
        let device = DeviceKey::from_json(content).unwrap();

        assert!(!device.self_signed(&UnavailableVerifier));
    }

    #[test]
    fn device_without_id_is_never_valid() {
        let device = DeviceKey::from_json(json!({ "user_id": "@alice:example.org" })).unwrap();

        assert_eq!(device.identifier(), None);
        assert!(!device.is_valid(&Ed25519Verifier));
    }

    #[test]
    fn devices_compare_by_user_and_identifier() {
        let a = DeviceKey::from_json(signed_device_json(1)).unwrap();
        let b = DeviceKey::from_json(signed_device_json(2)).unwrap();

        // Same user and device ID, differing key material.
        assert_eq!(a, b);
    }
}
