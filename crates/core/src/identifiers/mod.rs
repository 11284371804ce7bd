//! Identifier types for users, devices, rooms and device keys.
//!
//! All identifiers are opaque character sequences: whether a given string
//! actually names a usable key is a validity question answered by the trust
//! runtime, never by the parser. This keeps malformed upstream key uploads
//! representable.

/// Declares a borrowed/owned pair of opaque string identifier types.
macro_rules! opaque_identifier {
    (
        $(#[$attr:meta])*
        pub struct $id:ident, $owned:ident;
    ) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $id(str);

        impl $id {
            pub(crate) fn from_borrowed(s: &str) -> &Self {
                // SAFETY: $id is a repr(transparent) wrapper around str.
                unsafe { &*(s as *const str as *const Self) }
            }

            /// The identifier as a plain string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $id {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl ToOwned for $id {
            type Owned = $owned;

            fn to_owned(&self) -> $owned {
                $owned(self.0.into())
            }
        }

        impl<'a> From<&'a str> for &'a $id {
            fn from(s: &'a str) -> Self {
                $id::from_borrowed(s)
            }
        }

        impl std::fmt::Display for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(&self.0, f)
            }
        }

        impl serde::Serialize for $id {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl PartialEq<str> for $id {
            fn eq(&self, other: &str) -> bool {
                &self.0 == other
            }
        }

        impl PartialEq<&str> for $id {
            fn eq(&self, other: &&str) -> bool {
                &self.0 == *other
            }
        }

        impl PartialEq<$id> for str {
            fn eq(&self, other: &$id) -> bool {
                self == &other.0
            }
        }

        #[doc = concat!("Owned variant of [`", stringify!($id), "`].")]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $owned(Box<str>);

        impl $owned {
            /// The identifier as a plain string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $owned {
            type Target = $id;

            fn deref(&self) -> &$id {
                $id::from_borrowed(&self.0)
            }
        }

        impl std::borrow::Borrow<$id> for $owned {
            fn borrow(&self) -> &$id {
                $id::from_borrowed(&self.0)
            }
        }

        impl AsRef<$id> for $owned {
            fn as_ref(&self) -> &$id {
                $id::from_borrowed(&self.0)
            }
        }

        impl AsRef<str> for $owned {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $owned {
            fn from(s: &str) -> Self {
                Self(s.into())
            }
        }

        impl From<String> for $owned {
            fn from(s: String) -> Self {
                Self(s.into())
            }
        }

        impl From<Box<str>> for $owned {
            fn from(s: Box<str>) -> Self {
                Self(s)
            }
        }

        impl From<&$id> for $owned {
            fn from(id: &$id) -> Self {
                id.to_owned()
            }
        }

        impl From<$owned> for String {
            fn from(id: $owned) -> Self {
                id.0.into()
            }
        }

        impl std::fmt::Display for $owned {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $owned {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(&self.0, f)
            }
        }

        impl serde::Serialize for $owned {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $owned {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                <String as serde::Deserialize>::deserialize(deserializer).map(Into::into)
            }
        }

        impl PartialEq<str> for $owned {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $owned {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl PartialEq<String> for $owned {
            fn eq(&self, other: &String) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<$id> for $owned {
            fn eq(&self, other: &$id) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl PartialEq<&$id> for $owned {
            fn eq(&self, other: &&$id) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl PartialEq<$owned> for $id {
            fn eq(&self, other: &$owned) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl PartialEq<$owned> for &$id {
            fn eq(&self, other: &$owned) -> bool {
                self.as_str() == other.as_str()
            }
        }
    };
}

mod device_id;
mod key_id;
mod room_id;
mod user_id;

pub use self::device_id::{DeviceId, OwnedDeviceId};
pub use self::key_id::{DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceKeyId};
pub use self::room_id::{OwnedRoomId, RoomId};
pub use self::user_id::{OwnedUserId, UserId};
