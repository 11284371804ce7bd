use std::fmt;

use serde::{Deserialize, Serialize};

opaque_identifier! {
    /// A key identifier of the form `<algorithm>:<key name>`, e.g.
    /// `ed25519:JLAFKJWSCS`.
    ///
    /// No syntax is enforced on construction; entries with an unknown or
    /// missing algorithm prefix are simply never consulted for signature
    /// checks.
    pub struct DeviceKeyId, OwnedDeviceKeyId;
}

impl DeviceKeyId {
    /// Creates a key identifier from an algorithm and a key name.
    pub fn from_parts(algorithm: DeviceKeyAlgorithm, key_name: &str) -> OwnedDeviceKeyId {
        OwnedDeviceKeyId::from(format!("{algorithm}:{key_name}"))
    }

    /// The algorithm part of the identifier.
    ///
    /// If the identifier carries no `:` separator, the whole identifier is
    /// interpreted as the algorithm.
    pub fn algorithm(&self) -> DeviceKeyAlgorithm {
        match self.as_str().split_once(':') {
            Some((algorithm, _)) => DeviceKeyAlgorithm::from(algorithm),
            None => DeviceKeyAlgorithm::from(self.as_str()),
        }
    }

    /// The key name part of the identifier, or an empty string if the
    /// identifier carries no `:` separator.
    pub fn key_name(&self) -> &str {
        self.as_str().split_once(':').map(|(_, name)| name).unwrap_or("")
    }
}

/// The algorithm a device key is to be used with.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKeyAlgorithm {
    /// The Ed25519 signature algorithm.
    Ed25519,

    /// The Curve25519 ECDH algorithm.
    Curve25519,

    /// The Curve25519 ECDH algorithm, but the key also contains signatures.
    SignedCurve25519,

    /// An unrecognized algorithm.
    Unknown(String),
}

impl DeviceKeyAlgorithm {
    /// The string name of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Curve25519 => "curve25519",
            Self::SignedCurve25519 => "signed_curve25519",
            Self::Unknown(name) => name,
        }
    }
}

impl AsRef<str> for DeviceKeyAlgorithm {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for DeviceKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for DeviceKeyAlgorithm {
    fn from(s: &str) -> Self {
        match s {
            "ed25519" => Self::Ed25519,
            "curve25519" => Self::Curve25519,
            "signed_curve25519" => Self::SignedCurve25519,
            _ => Self::Unknown(s.to_owned()),
        }
    }
}

impl From<String> for DeviceKeyAlgorithm {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ed25519" => Self::Ed25519,
            "curve25519" => Self::Curve25519,
            "signed_curve25519" => Self::SignedCurve25519,
            _ => Self::Unknown(s),
        }
    }
}

impl Serialize for DeviceKeyAlgorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeviceKeyAlgorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Into::into)
    }
}
