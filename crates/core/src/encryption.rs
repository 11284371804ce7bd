//! Wire shapes of end-to-end encryption key uploads.
//!
//! These types deserialize leniently: apart from the owning user, every
//! field is defaulted so that a malformed upload still produces a value.
//! Whether such a value names a usable key is decided by the trust runtime.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId};

/// Signatures over a key object, keyed by the signing user and then by the
/// identifier of the key that produced each signature.
pub type Signatures = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>;

/// Identity keys for a device, as uploaded by its owner.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    pub user_id: OwnedUserId,

    /// The ID of the device these keys belong to.
    ///
    /// Absent in malformed uploads; such a device never becomes valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,

    /// The encryption algorithms supported by this device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// Public identity keys, keyed by `<algorithm>:<device_id>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,

    /// Signatures for the device key object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,

    /// Additional data added to the device key information by intermediate
    /// servers, and not covered by the signatures.
    #[serde(default, skip_serializing_if = "DeviceKeysUnsigned::is_empty")]
    pub unsigned: DeviceKeysUnsigned,
}

impl DeviceKeys {
    /// The public key of the given algorithm belonging to this device, if
    /// both the device ID and the key are present.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        let device_id = self.device_id.as_deref()?;
        self.keys
            .get(&DeviceKeyId::from_parts(algorithm, device_id))
            .map(String::as_str)
    }
}

/// Additional public claims about a device that are not covered by its
/// signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceKeysUnsigned {
    /// The display name which the user set on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl DeviceKeysUnsigned {
    fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}

/// A cross-signing key, as uploaded by its owner.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CrossSigningKeys {
    /// The ID of the user the key belongs to.
    pub user_id: OwnedUserId,

    /// What the key is used for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usage: Vec<KeyUsage>,

    /// The public key, keyed by `ed25519:<unpadded base64 public key>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,

    /// Signatures of the key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

impl CrossSigningKeys {
    /// The public key carried in the `keys` map, i.e. the key name of the
    /// first `ed25519:` entry.
    pub fn public_key(&self) -> Option<&str> {
        self.keys
            .keys()
            .find(|id| id.algorithm() == DeviceKeyAlgorithm::Ed25519)
            .map(|id| id.key_name())
    }
}

/// The usage of a cross-signing key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyUsage {
    /// The master key.
    Master,

    /// The self-signing key, attesting the user's own devices.
    SelfSigning,

    /// The user-signing key, attesting other users' master keys.
    UserSigning,

    /// An unrecognized usage label.
    Unknown(String),
}

impl KeyUsage {
    /// The string name of the usage label.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Master => "master",
            Self::SelfSigning => "self_signing",
            Self::UserSigning => "user_signing",
            Self::Unknown(label) => label,
        }
    }
}

impl AsRef<str> for KeyUsage {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for KeyUsage {
    fn from(s: &str) -> Self {
        match s {
            "master" => Self::Master,
            "self_signing" => Self::SelfSigning,
            "user_signing" => Self::UserSigning,
            _ => Self::Unknown(s.to_owned()),
        }
    }
}

impl Serialize for KeyUsage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for KeyUsage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(|s| Self::from(s.as_str()))
    }
}

/// An encryption algorithm to be used to encrypt messages sent to a device.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,

    /// Megolm version 1 using AES-256 and SHA-256.
    MegolmV1AesSha2,

    /// An unrecognized algorithm.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The string name of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::Unknown(name) => name,
        }
    }
}

impl AsRef<str> for EventEncryptionAlgorithm {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(s: &str) -> Self {
        match s {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            _ => Self::Unknown(s.to_owned()),
        }
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(|s| Self::from(s.as_str()))
    }
}
