//! Persistence hooks and the record shapes the trust runtime emits.
//!
//! The storage format itself is an external concern: the runtime issues
//! named mutations through [`KeyStore`] and converts bundles to and from
//! the record structs; whether those land in a relational table or a
//! key/value store is up to the embedder.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{DeviceId, JsonValue, OwnedDeviceId, OwnedUserId, UnixMillis, UserId};

/// Errors produced by a persistence backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend: `{0}`")]
    Backend(String),

    #[error("serde json: `{0}`")]
    SerdeJson(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }
}

/// A persisted device key row.
///
/// `content` stores the upstream JSON form as received, including
/// `signatures` and `unsigned`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DeviceKeyRecord {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub content: JsonValue,
    pub verified: bool,
    pub blocked: bool,
    pub last_active: UnixMillis,
}

/// A persisted cross-signing key row.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CrossSigningKeyRecord {
    pub user_id: OwnedUserId,
    pub public_key: String,
    pub content: JsonValue,
    pub verified: bool,
    pub blocked: bool,
}

/// A persisted user row.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct UserRecord {
    pub user_id: OwnedUserId,
    pub outdated: bool,
}

/// Side-effect interface invoked when local trust state changes.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn persist_device_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        verified: bool,
    ) -> Result<(), StoreError>;

    async fn persist_device_block(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        blocked: bool,
    ) -> Result<(), StoreError>;

    async fn persist_cross_signing_verification(
        &self,
        user_id: &UserId,
        public_key: &str,
        verified: bool,
    ) -> Result<(), StoreError>;

    async fn persist_cross_signing_block(
        &self,
        user_id: &UserId,
        public_key: &str,
        blocked: bool,
    ) -> Result<(), StoreError>;
}

/// An in-memory [`KeyStore`] for tests and embedders without a persistence
/// backend.
///
/// Flags are stored as `(verified, blocked)` pairs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    device_flags: Mutex<BTreeMap<(OwnedUserId, OwnedDeviceId), (bool, bool)>>,
    cross_signing_flags: Mutex<BTreeMap<(OwnedUserId, String), (bool, bool)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The persisted `(verified, blocked)` flags of a device, if any
    /// mutation reached the store.
    pub fn device_flags(&self, user_id: &UserId, device_id: &DeviceId) -> Option<(bool, bool)> {
        self.device_flags
            .lock()
            .unwrap()
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .copied()
    }

    /// The persisted `(verified, blocked)` flags of a cross-signing key, if
    /// any mutation reached the store.
    pub fn cross_signing_flags(&self, user_id: &UserId, public_key: &str) -> Option<(bool, bool)> {
        self.cross_signing_flags
            .lock()
            .unwrap()
            .get(&(user_id.to_owned(), public_key.to_owned()))
            .copied()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn persist_device_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        verified: bool,
    ) -> Result<(), StoreError> {
        self.device_flags
            .lock()
            .unwrap()
            .entry((user_id.to_owned(), device_id.to_owned()))
            .or_default()
            .0 = verified;
        Ok(())
    }

    async fn persist_device_block(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        blocked: bool,
    ) -> Result<(), StoreError> {
        self.device_flags
            .lock()
            .unwrap()
            .entry((user_id.to_owned(), device_id.to_owned()))
            .or_default()
            .1 = blocked;
        Ok(())
    }

    async fn persist_cross_signing_verification(
        &self,
        user_id: &UserId,
        public_key: &str,
        verified: bool,
    ) -> Result<(), StoreError> {
        self.cross_signing_flags
            .lock()
            .unwrap()
            .entry((user_id.to_owned(), public_key.to_owned()))
            .or_default()
            .0 = verified;
        Ok(())
    }

    async fn persist_cross_signing_block(
        &self,
        user_id: &UserId,
        public_key: &str,
        blocked: bool,
    ) -> Result<(), StoreError> {
        self.cross_signing_flags
            .lock()
            .unwrap()
            .entry((user_id.to_owned(), public_key.to_owned()))
            .or_default()
            .1 = blocked;
        Ok(())
    }
}
