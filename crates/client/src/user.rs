use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::encryption::KeyUsage;
use crate::core::signatures::SignatureVerifier;
use crate::core::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use crate::directory::KeyDirectory;
use crate::error::Result;
use crate::keys::{CrossSigningKey, DeviceKey, KeyRef, SignableKey};
use crate::store::{CrossSigningKeyRecord, DeviceKeyRecord, UserRecord};

/// Aggregate verification state of a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserVerifiedStatus {
    /// The user's identity is anchored and every device checks out.
    Verified,

    /// The user's identity is anchored, but at least one device is not
    /// verified.
    UnknownDevice,

    /// Nothing is known about the user's identity.
    Unknown,
}

/// All keys known for a single user.
///
/// Bundles are created when a user is first seen, mutated when the server
/// pushes new key material, and live as long as the containing directory.
#[derive(Debug)]
pub struct UserKeys {
    user_id: OwnedUserId,
    outdated: bool,
    device_keys: BTreeMap<OwnedDeviceId, DeviceKey>,
    cross_signing_keys: BTreeMap<String, CrossSigningKey>,
}

impl UserKeys {
    pub(crate) fn new(user_id: OwnedUserId) -> Self {
        Self {
            user_id,
            outdated: true,
            device_keys: BTreeMap::new(),
            cross_signing_keys: BTreeMap::new(),
        }
    }

    /// The user these keys belong to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether the key material needs to be re-fetched.
    pub fn outdated(&self) -> bool {
        self.outdated
    }

    pub(crate) fn set_outdated(&mut self, outdated: bool) {
        self.outdated = outdated;
    }

    /// The user's devices, keyed by device ID.
    pub fn device_keys(&self) -> &BTreeMap<OwnedDeviceId, DeviceKey> {
        &self.device_keys
    }

    /// The user's cross-signing keys, keyed by public key.
    pub fn cross_signing_keys(&self) -> &BTreeMap<String, CrossSigningKey> {
        &self.cross_signing_keys
    }

    pub(crate) fn set_keys(
        &mut self,
        device_keys: BTreeMap<OwnedDeviceId, DeviceKey>,
        cross_signing_keys: BTreeMap<String, CrossSigningKey>,
    ) {
        self.device_keys = device_keys;
        self.cross_signing_keys = cross_signing_keys;
    }

    pub(crate) fn device_mut(&mut self, device_id: &DeviceId) -> Option<&mut DeviceKey> {
        self.device_keys.get_mut(device_id)
    }

    pub(crate) fn cross_signing_mut(&mut self, public_key: &str) -> Option<&mut CrossSigningKey> {
        self.cross_signing_keys.get_mut(public_key)
    }

    /// The device or cross-signing key with the given identifier; the
    /// device table is consulted first.
    pub fn get_key(&self, identifier: &str) -> Option<KeyRef<'_>> {
        if let Some(device) = self.device_keys.get(<&DeviceId>::from(identifier)) {
            return Some(KeyRef::Device(device));
        }
        self.cross_signing_keys
            .get(identifier)
            .map(KeyRef::CrossSigning)
    }

    /// The first cross-signing key carrying the given usage label.
    pub fn get_cross_signing_key(&self, usage: KeyUsage) -> Option<&CrossSigningKey> {
        self.cross_signing_keys
            .values()
            .find(|key| key.usage().contains(&usage))
    }

    /// The user's master key.
    pub fn master_key(&self) -> Option<&CrossSigningKey> {
        self.get_cross_signing_key(KeyUsage::Master)
    }

    /// The user's self-signing key.
    pub fn self_signing_key(&self) -> Option<&CrossSigningKey> {
        self.get_cross_signing_key(KeyUsage::SelfSigning)
    }

    /// The user's user-signing key.
    pub fn user_signing_key(&self) -> Option<&CrossSigningKey> {
        self.get_cross_signing_key(KeyUsage::UserSigning)
    }

    /// Rolls the trust state of the user's keys up into a single verdict.
    ///
    /// A device-level gap is only reported as [`UserVerifiedStatus::UnknownDevice`]
    /// once the user's identity is anchored through a verified master key;
    /// without that anchor it collapses into [`UserVerifiedStatus::Unknown`].
    pub fn verified(&self, directory: &KeyDirectory) -> UserVerifiedStatus {
        let Some(master_key) = self.master_key() else {
            return UserVerifiedStatus::Unknown;
        };

        let all_devices_verified = self
            .device_keys
            .values()
            .all(|device| device.verified(directory));

        if master_key.verified(directory) {
            if all_devices_verified {
                UserVerifiedStatus::Verified
            } else {
                UserVerifiedStatus::UnknownDevice
            }
        } else if all_devices_verified {
            UserVerifiedStatus::Verified
        } else {
            UserVerifiedStatus::Unknown
        }
    }

    pub(crate) fn from_records(
        user: UserRecord,
        devices: Vec<DeviceKeyRecord>,
        cross_signing: Vec<CrossSigningKeyRecord>,
        verifier: &dyn SignatureVerifier,
    ) -> Result<Self> {
        let mut bundle = Self::new(user.user_id);
        bundle.outdated = user.outdated;

        for record in devices {
            let mut device = DeviceKey::from_json(record.content)?;
            device.set_verified_flag(record.verified);
            device.set_blocked_flag(record.blocked);
            device.set_last_active(record.last_active);
            if !device.is_valid(verifier) {
                bundle.outdated = true;
            }
            bundle.device_keys.insert(record.device_id, device);
        }

        for record in cross_signing {
            let mut key = CrossSigningKey::from_json(record.content)?;
            key.set_verified_flag(record.verified);
            key.set_blocked_flag(record.blocked);
            if !key.is_valid() {
                bundle.outdated = true;
            }
            bundle.cross_signing_keys.insert(record.public_key, key);
        }

        Ok(bundle)
    }

    /// Serializes the bundle back into persistence records.
    pub fn to_records(
        &self,
    ) -> (
        UserRecord,
        Vec<DeviceKeyRecord>,
        Vec<CrossSigningKeyRecord>,
    ) {
        let user = UserRecord {
            user_id: self.user_id.clone(),
            outdated: self.outdated,
        };

        let devices = self
            .device_keys
            .iter()
            .map(|(device_id, device)| DeviceKeyRecord {
                user_id: self.user_id.clone(),
                device_id: device_id.clone(),
                content: device.content().clone(),
                verified: device.direct_verified(),
                blocked: device.blocked_flag(),
                last_active: device.last_active(),
            })
            .collect();

        let cross_signing = self
            .cross_signing_keys
            .iter()
            .map(|(public_key, key)| CrossSigningKeyRecord {
                user_id: self.user_id.clone(),
                public_key: public_key.clone(),
                content: key.content().clone(),
                verified: key.direct_verified(),
                blocked: key.blocked_flag(),
            })
            .collect();

        (user, devices, cross_signing)
    }
}
