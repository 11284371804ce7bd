//! The process-wide view of all known users' keys, and the signature chain
//! walk that decides trust.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::config::EncryptionConfig;
use crate::core::signatures::{Ed25519Verifier, SignatureVerifier};
use crate::core::{DeviceId, DeviceKeyAlgorithm, JsonValue, OwnedDeviceId, OwnedUserId, UnixMillis, UserId};
use crate::error::{Error, Result};
use crate::keys::{CrossSigningKey, DeviceKey, KeyRef, SignableKey};
use crate::signing::{CrossSigningDelegate, NoCrossSigning, SigningTarget};
use crate::store::{CrossSigningKeyRecord, DeviceKeyRecord, KeyStore, UserRecord};
use crate::user::UserKeys;

/// All known users' key bundles, plus the identity of the local user.
///
/// The directory owns every bundle and, through them, every key. Trust
/// relationships between keys are expressed by `(user, key id)` lookups
/// against the directory, never by references between key objects, so the
/// ownership graph stays a forest while the signature graph may contain
/// cycles.
pub struct KeyDirectory {
    self_user_id: OwnedUserId,
    config: EncryptionConfig,
    users: BTreeMap<OwnedUserId, UserKeys>,
    verifier: Arc<dyn SignatureVerifier>,
    store: Arc<dyn KeyStore>,
    cross_signing: Arc<dyn CrossSigningDelegate>,
    // Keeps unawaited co-signing uploads from outliving the directory;
    // anything still running is aborted on drop.
    signing_tasks: JoinSet<()>,
}

impl KeyDirectory {
    /// Creates an empty directory for the given local user.
    pub fn new(
        self_user_id: impl Into<OwnedUserId>,
        config: EncryptionConfig,
        store: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            config,
            users: BTreeMap::new(),
            verifier: Arc::new(Ed25519Verifier),
            store,
            cross_signing: Arc::new(NoCrossSigning),
            signing_tasks: JoinSet::new(),
        }
    }

    /// Replaces the signature verifier, e.g. with
    /// [`UnavailableVerifier`](crate::core::signatures::UnavailableVerifier)
    /// when the primitive cannot be loaded.
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Wires up the cross-signing component used to co-sign newly verified
    /// keys.
    pub fn with_cross_signing(mut self, cross_signing: Arc<dyn CrossSigningDelegate>) -> Self {
        self.cross_signing = cross_signing;
        self
    }

    /// The local user.
    pub fn self_user_id(&self) -> &UserId {
        &self.self_user_id
    }

    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    /// The signature verifier in use.
    pub fn verifier(&self) -> &dyn SignatureVerifier {
        &*self.verifier
    }

    /// The key bundle of the given user, if the user has been seen.
    pub fn user_keys(&self, user_id: &UserId) -> Option<&UserKeys> {
        self.users.get(user_id)
    }

    /// Iterates over all known users' bundles.
    pub fn users(&self) -> impl Iterator<Item = &UserKeys> {
        self.users.values()
    }

    /// Applies a key upload for a user, creating the bundle on first sight.
    ///
    /// Local trust flags survive as long as the Ed25519 material of a
    /// re-uploaded key is unchanged; a key that changed its material starts
    /// over untrusted. The bundle is marked outdated when any of the new
    /// keys fails validity.
    pub fn update_user_keys(
        &mut self,
        user_id: impl Into<OwnedUserId>,
        device_keys: BTreeMap<OwnedDeviceId, JsonValue>,
        cross_signing_keys: Vec<JsonValue>,
    ) {
        let user_id = user_id.into();
        let verifier = self.verifier.clone();
        let user = self
            .users
            .entry(user_id.clone())
            .or_insert_with(|| UserKeys::new(user_id.clone()));
        let mut outdated = false;

        let mut new_devices = BTreeMap::new();
        for (device_id, content) in device_keys {
            let mut device = match DeviceKey::from_json(content) {
                Ok(device) => device,
                Err(error) => {
                    warn!(%user_id, %device_id, error = ?error, "ignoring malformed device keys");
                    outdated = true;
                    continue;
                }
            };
            if device.user_id() != &*user_id
                || device.identifier().is_some_and(|id| id != device_id.as_str())
            {
                warn!(%user_id, %device_id, "ignoring device keys uploaded under a foreign identity");
                outdated = true;
                continue;
            }
            if !device.is_valid(&*verifier) {
                outdated = true;
            }
            if let Some(previous) = user.device_keys().get(&device_id) {
                if previous.ed25519_key().is_some()
                    && previous.ed25519_key() == device.ed25519_key()
                {
                    device.set_verified_flag(previous.direct_verified());
                    device.set_blocked_flag(previous.blocked_flag());
                }
            }
            device.set_last_active(UnixMillis::now());
            new_devices.insert(device_id, device);
        }

        let mut new_cross_signing = BTreeMap::new();
        for content in cross_signing_keys {
            let mut key = match CrossSigningKey::from_json(content) {
                Ok(key) => key,
                Err(error) => {
                    warn!(%user_id, error = ?error, "ignoring malformed cross-signing key");
                    outdated = true;
                    continue;
                }
            };
            if key.user_id() != &*user_id {
                warn!(%user_id, "ignoring cross-signing key uploaded under a foreign identity");
                outdated = true;
                continue;
            }
            let Some(public_key) = key.public_key().map(str::to_owned) else {
                warn!(%user_id, "ignoring cross-signing key without public key material");
                outdated = true;
                continue;
            };
            if !key.is_valid() {
                outdated = true;
            }
            if let Some(previous) = user.cross_signing_keys().get(&public_key) {
                if previous.ed25519_key().is_some() && previous.ed25519_key() == key.ed25519_key() {
                    key.set_verified_flag(previous.direct_verified());
                    key.set_blocked_flag(previous.blocked_flag());
                }
            }
            new_cross_signing.insert(public_key, key);
        }

        user.set_keys(new_devices, new_cross_signing);
        user.set_outdated(outdated);
    }

    /// Loads a user's bundle from persisted records, replacing whatever is
    /// in memory for that user.
    pub fn load_user_records(
        &mut self,
        user: UserRecord,
        devices: Vec<DeviceKeyRecord>,
        cross_signing: Vec<CrossSigningKeyRecord>,
    ) -> Result<()> {
        let bundle = UserKeys::from_records(user, devices, cross_signing, &*self.verifier)?;
        self.users.insert(bundle.user_id().to_owned(), bundle);
        Ok(())
    }

    /// Whether a chain of valid signatures connects the given key to a
    /// trust anchor.
    ///
    /// With `verified_only`, any directly verified signer anchors the
    /// chain; in either mode, the local user's directly verified master key
    /// does.
    pub fn has_valid_signature_chain(&self, key: KeyRef<'_>, verified_only: bool) -> bool {
        self.signature_chain(key, verified_only, &mut HashSet::new(), &HashSet::new())
    }

    /// Like [`Self::has_valid_signature_chain`], but only signatures made
    /// by the given users are followed.
    pub fn has_valid_signature_chain_from(
        &self,
        key: KeyRef<'_>,
        verified_only: bool,
        only_user_ids: &HashSet<OwnedUserId>,
    ) -> bool {
        self.signature_chain(key, verified_only, &mut HashSet::new(), only_user_ids)
    }

    fn signature_chain(
        &self,
        key: KeyRef<'_>,
        verified_only: bool,
        visited: &mut HashSet<String>,
        only_user_ids: &HashSet<OwnedUserId>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(identifier) = key.identifier() else {
            return false;
        };

        let node = format!("{};{}", key.user_id(), identifier);
        if visited.contains(&node) {
            return false;
        }
        if !only_user_ids.is_empty() && !only_user_ids.contains(key.user_id()) {
            return false;
        }
        visited.insert(node);

        for (signer_user_id, signature_set) in key.signatures() {
            let Some(signer_keys) = self.users.get(signer_user_id) else {
                continue;
            };
            // No transitive trust: only the owning user and the local user
            // may vouch for a key.
            if signer_user_id != key.user_id() && *signer_user_id != self.self_user_id {
                continue;
            }

            for (full_key_id, signature) in signature_set {
                if full_key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
                    continue;
                }
                let key_id = full_key_id.key_name();
                // A signature of a key by itself carries no chain
                // information.
                if signer_user_id == key.user_id() && key_id == identifier {
                    continue;
                }
                let Some(signer_key) = signer_keys.get_key(key_id) else {
                    continue;
                };
                if !only_user_ids.is_empty() && !only_user_ids.contains(signer_key.user_id()) {
                    continue;
                }
                if signer_key.blocked(&*self.verifier) {
                    continue;
                }

                let valid = match key.signature_cache().get(signer_user_id, full_key_id) {
                    Some(valid) => valid,
                    None => {
                        let Some(public_key) = signer_key.ed25519_key() else {
                            continue;
                        };
                        let Ok(message) = key.signing_content() else {
                            continue;
                        };
                        // Chain edges fail closed when the primitive is
                        // unavailable.
                        let valid = self
                            .verifier
                            .verify_ed25519(public_key, message.as_bytes(), signature)
                            .is_valid();
                        key.signature_cache().insert(signer_user_id, full_key_id, valid);
                        valid
                    }
                };
                if !valid {
                    continue;
                }

                if (verified_only && signer_key.direct_verified())
                    || (signer_key.is_master()
                        && signer_key.direct_verified()
                        && signer_key.user_id() == &*self.self_user_id)
                {
                    return true;
                }
                if self.signature_chain(signer_key, verified_only, visited, only_user_ids) {
                    return true;
                }
            }
        }

        false
    }

    /// Marks a device as verified or unverified.
    ///
    /// Unknown or invalid devices are left untouched. On a newly verified
    /// device the cross-signing component is asked to co-sign it; that
    /// upload is not awaited and its failure does not roll the flag back.
    pub async fn set_device_verified(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        verified: bool,
    ) -> Result<()> {
        let verifier = self.verifier.clone();
        let Some(device) = self
            .users
            .get_mut(user_id)
            .and_then(|user| user.device_mut(device_id))
        else {
            return Ok(());
        };
        if !device.is_valid(&*verifier) {
            return Ok(());
        }

        let newly_verified = verified && !device.direct_verified();
        device.set_verified_flag(verified);
        let target = SigningTarget {
            user_id: user_id.to_owned(),
            key_id: device_id.as_str().to_owned(),
            content: device.content().clone(),
        };
        if newly_verified {
            self.request_signing(vec![target]);
        }

        self.store
            .persist_device_verification(user_id, device_id, verified)
            .await?;
        Ok(())
    }

    /// Marks a device as blocked or unblocked. Unknown or invalid devices
    /// are left untouched.
    pub async fn set_device_blocked(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        blocked: bool,
    ) -> Result<()> {
        let verifier = self.verifier.clone();
        let Some(device) = self
            .users
            .get_mut(user_id)
            .and_then(|user| user.device_mut(device_id))
        else {
            return Ok(());
        };
        if !device.is_valid(&*verifier) {
            return Ok(());
        }
        device.set_blocked_flag(blocked);

        self.store
            .persist_device_block(user_id, device_id, blocked)
            .await?;
        Ok(())
    }

    /// Marks a cross-signing key as verified or unverified.
    ///
    /// Unlike devices, an unknown or invalid cross-signing key is an error:
    /// cross-signing key validity is a prerequisite for all anchoring
    /// decisions.
    pub async fn set_cross_signing_verified(
        &mut self,
        user_id: &UserId,
        public_key: &str,
        verified: bool,
    ) -> Result<()> {
        let Some(key) = self
            .users
            .get_mut(user_id)
            .and_then(|user| user.cross_signing_mut(public_key))
        else {
            return Err(Error::InvalidKey(format!(
                "no cross-signing key `{public_key}` known for `{user_id}`"
            )));
        };
        if !key.is_valid() {
            return Err(Error::InvalidKey(format!(
                "cross-signing key `{public_key}` of `{user_id}` is not usable"
            )));
        }

        let newly_verified = verified && !key.direct_verified();
        key.set_verified_flag(verified);
        let target = SigningTarget {
            user_id: user_id.to_owned(),
            key_id: public_key.to_owned(),
            content: key.content().clone(),
        };
        if newly_verified {
            self.request_signing(vec![target]);
        }

        self.store
            .persist_cross_signing_verification(user_id, public_key, verified)
            .await?;
        Ok(())
    }

    /// Marks a cross-signing key as blocked or unblocked. Unknown or
    /// invalid keys are an error, as with
    /// [`Self::set_cross_signing_verified`].
    pub async fn set_cross_signing_blocked(
        &mut self,
        user_id: &UserId,
        public_key: &str,
        blocked: bool,
    ) -> Result<()> {
        let Some(key) = self
            .users
            .get_mut(user_id)
            .and_then(|user| user.cross_signing_mut(public_key))
        else {
            return Err(Error::InvalidKey(format!(
                "no cross-signing key `{public_key}` known for `{user_id}`"
            )));
        };
        if !key.is_valid() {
            return Err(Error::InvalidKey(format!(
                "cross-signing key `{public_key}` of `{user_id}` is not usable"
            )));
        }
        key.set_blocked_flag(blocked);

        self.store
            .persist_cross_signing_block(user_id, public_key, blocked)
            .await?;
        Ok(())
    }

    fn request_signing(&mut self, targets: Vec<SigningTarget>) {
        if !self.cross_signing.signable(&targets) {
            return;
        }
        // Reap whatever already finished before adding another task.
        while self.signing_tasks.try_join_next().is_some() {}

        let cross_signing = self.cross_signing.clone();
        self.signing_tasks.spawn(async move {
            if let Err(error) = cross_signing.sign(targets).await {
                warn!(error = ?error, "co-signing request failed");
            }
        });
    }
}

impl KeyRef<'_> {
    /// Whether this key is currently trusted: present, not blocked, and
    /// either directly verified or anchored by a verified-only signature
    /// chain.
    pub fn verified(self, directory: &KeyDirectory) -> bool {
        self.identifier().is_some()
            && !self.blocked(directory.verifier())
            && (self.direct_verified() || self.cross_verified(directory))
    }

    /// Whether a verified-only signature chain anchors this key.
    pub fn cross_verified(self, directory: &KeyDirectory) -> bool {
        directory.has_valid_signature_chain(self, true)
    }

    /// Whether any signature chain reaches this key, even one terminating
    /// at an anchor that is only valid for the any-signed policy.
    pub fn signed(self, directory: &KeyDirectory) -> bool {
        directory.has_valid_signature_chain(self, false)
    }

    /// Whether message payloads may be encrypted to this key.
    ///
    /// While the owning user's master key is not verified there is no
    /// identity anchor to hold the key against; encryption is then
    /// permitted optimistically, unless configured otherwise.
    pub fn encrypt_to_device(self, directory: &KeyDirectory) -> bool {
        if self.blocked(directory.verifier())
            || self.identifier().is_none()
            || self.ed25519_key().is_none()
        {
            return false;
        }

        let master_verified = directory
            .user_keys(self.user_id())
            .and_then(|user| user.master_key())
            .is_some_and(|master| KeyRef::CrossSigning(master).verified(directory));
        if master_verified {
            self.verified(directory)
        } else {
            directory.config().optimistic_encryption
        }
    }
}

impl DeviceKey {
    /// Whether this device is currently trusted.
    pub fn verified(&self, directory: &KeyDirectory) -> bool {
        KeyRef::Device(self).verified(directory)
    }

    /// Whether a verified-only signature chain anchors this device.
    pub fn cross_verified(&self, directory: &KeyDirectory) -> bool {
        KeyRef::Device(self).cross_verified(directory)
    }

    /// Whether any signature chain reaches this device.
    pub fn signed(&self, directory: &KeyDirectory) -> bool {
        KeyRef::Device(self).signed(directory)
    }

    /// Whether message payloads may be encrypted to this device.
    pub fn encrypt_to_device(&self, directory: &KeyDirectory) -> bool {
        KeyRef::Device(self).encrypt_to_device(directory)
    }
}

impl CrossSigningKey {
    /// Whether this key is currently trusted.
    pub fn verified(&self, directory: &KeyDirectory) -> bool {
        KeyRef::CrossSigning(self).verified(directory)
    }

    /// Whether a verified-only signature chain anchors this key.
    pub fn cross_verified(&self, directory: &KeyDirectory) -> bool {
        KeyRef::CrossSigning(self).cross_verified(directory)
    }

    /// Whether any signature chain reaches this key.
    pub fn signed(&self, directory: &KeyDirectory) -> bool {
        KeyRef::CrossSigning(self).signed(directory)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use assert_matches2::assert_matches;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer as _, SigningKey};
    use serde_json::{Value as JsonValue, json};

    use super::KeyDirectory;
    use crate::config::EncryptionConfig;
    use crate::core::serde::base64;
    use crate::core::signatures::{
        Ed25519Verifier, SignatureVerifier, UnavailableVerifier, Verification, signable_json,
    };
    use crate::core::{DeviceId, OwnedDeviceId, OwnedUserId, UnixMillis, UserId};
    use crate::error::{Error, Result};
    use crate::keys::SignableKey;
    use crate::signing::{CrossSigningDelegate, SigningTarget};
    use crate::store::{CrossSigningKeyRecord, DeviceKeyRecord, MemoryStore, UserRecord};
    use crate::user::UserVerifiedStatus;

    const ME: &str = "@me:example.org";
    const BOB: &str = "@bob:example.org";
    const CAROL: &str = "@carol:example.org";

    fn uid(s: &str) -> &UserId {
        s.into()
    }

    fn did(s: &str) -> &DeviceId {
        s.into()
    }

    fn keypair(seed: u8) -> (SigningKey, String) {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let public_key = base64::encode(signing_key.verifying_key().to_bytes());
        (signing_key, public_key)
    }

    /// Adds a signature by `signer` over the signable form of `content`.
    fn sign(content: &mut JsonValue, signer: &SigningKey, signer_user: &str, key_id: &str) {
        let message = signable_json(content).unwrap();
        let signature = base64::encode(signer.sign(message.as_bytes()).to_bytes());
        content["signatures"][signer_user][format!("ed25519:{key_id}")] = signature.into();
    }

    /// A complete, self-signed device key upload.
    fn device_json(user: &str, device_id: &str, seed: u8) -> (JsonValue, SigningKey, String) {
        let (signing_key, public_key) = keypair(seed);
        let mut content = json!({
            "user_id": user,
            "device_id": device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {},
        });
        content["keys"][format!("curve25519:{device_id}")] =
            base64::encode([seed.wrapping_add(100); 32]).into();
        content["keys"][format!("ed25519:{device_id}")] = public_key.clone().into();
        sign(&mut content, &signing_key, user, device_id);
        (content, signing_key, public_key)
    }

    fn cross_signing_json(user: &str, usage: &str, seed: u8) -> (JsonValue, SigningKey, String) {
        let (signing_key, public_key) = keypair(seed);
        let mut content = json!({
            "user_id": user,
            "usage": [usage],
            "keys": {},
        });
        content["keys"][format!("ed25519:{public_key}")] = public_key.clone().into();
        (content, signing_key, public_key)
    }

    fn devices(entries: Vec<(&str, JsonValue)>) -> BTreeMap<OwnedDeviceId, JsonValue> {
        entries
            .into_iter()
            .map(|(id, content)| (OwnedDeviceId::from(id), content))
            .collect()
    }

    fn directory() -> (KeyDirectory, Arc<MemoryStore>) {
        directory_with_config(EncryptionConfig::default())
    }

    fn directory_with_config(config: EncryptionConfig) -> (KeyDirectory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (KeyDirectory::new(ME, config, store.clone()), store)
    }

    /// Installs a directly verified master key for the local user and
    /// returns its signing key and public key.
    async fn own_verified_master(dir: &mut KeyDirectory, seed: u8) -> (SigningKey, String) {
        let (master, signing_key, public_key) = cross_signing_json(ME, "master", seed);
        dir.update_user_keys(ME, BTreeMap::new(), vec![master]);
        dir.set_cross_signing_verified(uid(ME), &public_key, true)
            .await
            .unwrap();
        (signing_key, public_key)
    }

    #[tokio::test]
    async fn chain_anchors_at_local_verified_master() {
        let (mut dir, _store) = directory();
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &master_key, ME, &master_pub);
        let (bob_master, _, _) = cross_signing_json(BOB, "master", 11);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![bob_master]);

        let bob = dir.user_keys(uid(BOB)).unwrap();
        let device = bob.device_keys().get(did("BOBDEV")).unwrap();
        assert!(device.cross_verified(&dir));
        assert!(device.verified(&dir));
        assert!(device.signed(&dir));
        assert_eq!(bob.verified(&dir), UserVerifiedStatus::Verified);
    }

    #[tokio::test]
    async fn third_party_signatures_are_ignored() {
        let (mut dir, _store) = directory();

        let (carol_master, carol_key, carol_pub) = cross_signing_json(CAROL, "master", 12);
        dir.update_user_keys(CAROL, BTreeMap::new(), vec![carol_master]);
        dir.set_cross_signing_verified(uid(CAROL), &carol_pub, true)
            .await
            .unwrap();

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &carol_key, CAROL, &carol_pub);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.cross_verified(&dir));
    }

    #[test]
    fn signature_cycles_terminate() {
        let (mut dir, _store) = directory();

        let (mut master, master_key, master_pub) = cross_signing_json(BOB, "master", 13);
        let (mut self_signing, self_signing_key, self_signing_pub) =
            cross_signing_json(BOB, "self_signing", 14);
        sign(&mut master, &self_signing_key, BOB, &self_signing_pub);
        sign(&mut self_signing, &master_key, BOB, &master_pub);
        dir.update_user_keys(BOB, BTreeMap::new(), vec![master, self_signing]);

        let bob = dir.user_keys(uid(BOB)).unwrap();
        for key in bob.cross_signing_keys().values() {
            assert!(!key.cross_verified(&dir));
            assert!(!key.signed(&dir));
        }
    }

    #[tokio::test]
    async fn unavailable_primitive_loads_devices_but_fails_chains() {
        let (mut dir, _store) = directory();
        dir = dir.with_verifier(Arc::new(UnavailableVerifier));
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &master_key, ME, &master_pub);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert!(!bob.outdated());
        let device = bob.device_keys().get(did("BOBDEV")).unwrap();
        assert!(device.self_signed(dir.verifier()));
        assert!(device.is_valid(dir.verifier()));
        assert!(!device.cross_verified(&dir));
    }

    #[tokio::test]
    async fn blocking_overrides_direct_verification() {
        let (mut dir, _store) = directory();

        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);
        dir.set_device_verified(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();
        dir.set_device_blocked(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.direct_verified());
        assert!(!device.verified(&dir));
    }

    #[tokio::test]
    async fn rollup_reports_unknown_device_once_anchored() {
        let (mut dir, _store) = directory();
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_master, _, bob_master_pub) = cross_signing_json(BOB, "master", 11);
        sign(&mut bob_master, &master_key, ME, &master_pub);
        let (d1, _, _) = device_json(BOB, "FIRST", 20);
        let (d2, _, _) = device_json(BOB, "SECOND", 21);
        dir.update_user_keys(
            BOB,
            devices(vec![("FIRST", d1), ("SECOND", d2)]),
            vec![bob_master],
        );
        dir.set_cross_signing_verified(uid(BOB), &bob_master_pub, true)
            .await
            .unwrap();
        dir.set_device_verified(uid(BOB), did("FIRST"), true)
            .await
            .unwrap();

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert_eq!(bob.verified(&dir), UserVerifiedStatus::UnknownDevice);

        dir.set_device_verified(uid(BOB), did("SECOND"), true)
            .await
            .unwrap();
        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert_eq!(bob.verified(&dir), UserVerifiedStatus::Verified);
    }

    #[test]
    fn rollup_without_master_key_is_unknown() {
        let (mut dir, _store) = directory();
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert_eq!(bob.verified(&dir), UserVerifiedStatus::Unknown);
    }

    #[test]
    fn rollup_without_anchor_collapses_device_gaps() {
        let (mut dir, _store) = directory();
        let (bob_master, _, _) = cross_signing_json(BOB, "master", 11);
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(
            BOB,
            devices(vec![("BOBDEV", bob_device)]),
            vec![bob_master],
        );

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert_eq!(bob.verified(&dir), UserVerifiedStatus::Unknown);
    }

    #[test]
    fn chain_fails_without_signatures() {
        let (mut dir, _store) = directory();
        // The only signature is the device's own, which carries no chain
        // information.
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.cross_verified(&dir));
        assert!(!device.signed(&dir));
    }

    #[test]
    fn signatures_by_unknown_users_are_skipped() {
        let (mut dir, _store) = directory();

        // The local user's master key signs the device, but no bundle for
        // the local user was ever loaded.
        let (master_key, master_pub) = keypair(10);
        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &master_key, ME, &master_pub);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.cross_verified(&dir));
    }

    #[tokio::test]
    async fn whitelist_constrains_the_walk() {
        let (mut dir, _store) = directory();
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &master_key, ME, &master_pub);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let bob = dir.user_keys(uid(BOB)).unwrap();
        let device = bob.device_keys().get(did("BOBDEV")).unwrap();
        let key = crate::keys::KeyRef::Device(device);

        let bob_only: HashSet<OwnedUserId> = [OwnedUserId::from(BOB)].into();
        assert!(!dir.has_valid_signature_chain_from(key, true, &bob_only));

        let bob_and_me: HashSet<OwnedUserId> =
            [OwnedUserId::from(BOB), OwnedUserId::from(ME)].into();
        assert!(dir.has_valid_signature_chain_from(key, true, &bob_and_me));
    }

    #[tokio::test]
    async fn disabled_encryption_fails_every_chain() {
        let (mut dir, _store) = directory_with_config(EncryptionConfig {
            enabled: false,
            ..EncryptionConfig::default()
        });
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &master_key, ME, &master_pub);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.cross_verified(&dir));
    }

    #[tokio::test]
    async fn verification_results_are_memoized() {
        #[derive(Default)]
        struct CountingVerifier(AtomicUsize);

        impl SignatureVerifier for CountingVerifier {
            fn verify_ed25519(
                &self,
                public_key: &str,
                message: &[u8],
                signature: &str,
            ) -> Verification {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ed25519Verifier.verify_ed25519(public_key, message, signature)
            }
        }

        let verifier = Arc::new(CountingVerifier::default());
        let (mut dir, _store) = directory();
        dir = dir.with_verifier(verifier.clone());
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &master_key, ME, &master_pub);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.cross_verified(&dir));
        let after_first_walk = verifier.0.load(Ordering::SeqCst);

        assert!(device.cross_verified(&dir));
        assert_eq!(verifier.0.load(Ordering::SeqCst), after_first_walk);
    }

    #[tokio::test]
    async fn direct_verified_device_anchors_only_verified_chains() {
        let (mut dir, _store) = directory();

        let (my_device, my_signing_key, _) = device_json(ME, "MYDEV", 15);
        dir.update_user_keys(ME, devices(vec![("MYDEV", my_device)]), vec![]);
        dir.set_device_verified(uid(ME), did("MYDEV"), true)
            .await
            .unwrap();

        let (mut bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        sign(&mut bob_device, &my_signing_key, ME, "MYDEV");
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.cross_verified(&dir));
        // The any-signed policy only anchors at the local master.
        assert!(!device.signed(&dir));
    }

    #[tokio::test]
    async fn invalid_devices_ignore_mutations() {
        let (mut dir, store) = directory();

        let content = json!({
            "user_id": BOB,
            "device_id": "BOBDEV",
            "keys": {},
        });
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", content)]), vec![]);
        assert!(dir.user_keys(uid(BOB)).unwrap().outdated());

        dir.set_device_verified(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.direct_verified());
        assert_eq!(store.device_flags(uid(BOB), did("BOBDEV")), None);
    }

    #[tokio::test]
    async fn invalid_cross_signing_mutations_are_errors() {
        let (mut dir, _store) = directory();
        dir.update_user_keys(BOB, BTreeMap::new(), vec![]);

        assert_matches!(
            dir.set_cross_signing_verified(uid(BOB), "missing", true).await,
            Err(Error::InvalidKey(_))
        );
        assert_matches!(
            dir.set_cross_signing_blocked(uid(BOB), "missing", true).await,
            Err(Error::InvalidKey(_))
        );
    }

    #[tokio::test]
    async fn device_trust_mutations_are_persisted() {
        let (mut dir, store) = directory();
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);

        dir.set_device_verified(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();
        assert_eq!(
            store.device_flags(uid(BOB), did("BOBDEV")),
            Some((true, false))
        );

        dir.set_device_blocked(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();
        assert_eq!(
            store.device_flags(uid(BOB), did("BOBDEV")),
            Some((true, true))
        );
    }

    #[tokio::test]
    async fn co_signing_runs_unawaited_and_failures_stick() {
        struct RecordingCrossSigning {
            sender: Mutex<Option<tokio::sync::oneshot::Sender<Vec<SigningTarget>>>>,
        }

        #[async_trait]
        impl CrossSigningDelegate for RecordingCrossSigning {
            fn signable(&self, _targets: &[SigningTarget]) -> bool {
                true
            }

            async fn sign(&self, targets: Vec<SigningTarget>) -> Result<()> {
                if let Some(sender) = self.sender.lock().unwrap().take() {
                    let _ = sender.send(targets);
                }
                Err(Error::InvalidKey("signature upload failed".to_owned()))
            }
        }

        let (sender, receiver) = tokio::sync::oneshot::channel();
        let (mut dir, _store) = directory();
        dir = dir.with_cross_signing(Arc::new(RecordingCrossSigning {
            sender: Mutex::new(Some(sender)),
        }));

        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);
        dir.set_device_verified(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();

        let targets = receiver.await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].user_id, BOB);
        assert_eq!(targets[0].key_id, "BOBDEV");

        // The failed upload does not roll the local flag back.
        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.direct_verified());
    }

    #[tokio::test]
    async fn encrypt_to_device_is_optimistic_without_an_anchor() {
        let (mut dir, _store) = directory();
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device.clone())]), vec![]);

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.encrypt_to_device(&dir));

        // The optimism can be configured away.
        let (mut strict_dir, _store) = directory_with_config(EncryptionConfig {
            optimistic_encryption: false,
            ..EncryptionConfig::default()
        });
        strict_dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);
        let device = strict_dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.encrypt_to_device(&strict_dir));
    }

    #[tokio::test]
    async fn encrypt_to_device_requires_trust_once_anchored() {
        let (mut dir, _store) = directory();
        let (master_key, master_pub) = own_verified_master(&mut dir, 10).await;

        let (mut bob_master, _, bob_master_pub) = cross_signing_json(BOB, "master", 11);
        sign(&mut bob_master, &master_key, ME, &master_pub);
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(
            BOB,
            devices(vec![("BOBDEV", bob_device)]),
            vec![bob_master],
        );
        dir.set_cross_signing_verified(uid(BOB), &bob_master_pub, true)
            .await
            .unwrap();

        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.encrypt_to_device(&dir));

        dir.set_device_verified(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();
        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.encrypt_to_device(&dir));

        dir.set_device_blocked(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();
        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.encrypt_to_device(&dir));
    }

    #[tokio::test]
    async fn reuploaded_material_keeps_local_trust() {
        let (mut dir, _store) = directory();
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device.clone())]), vec![]);
        dir.set_device_verified(uid(BOB), did("BOBDEV"), true)
            .await
            .unwrap();

        // Same material again: the flag survives.
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", bob_device)]), vec![]);
        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(device.direct_verified());

        // Fresh material under the same device ID: trust starts over.
        let (rotated, _, _) = device_json(BOB, "BOBDEV", 21);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", rotated)]), vec![]);
        let device = dir
            .user_keys(uid(BOB))
            .unwrap()
            .device_keys()
            .get(did("BOBDEV"))
            .unwrap();
        assert!(!device.direct_verified());
    }

    #[test]
    fn malformed_uploads_mark_the_bundle_outdated() {
        let (mut dir, _store) = directory();
        let (good, _, _) = device_json(BOB, "GOOD", 20);
        dir.update_user_keys(
            BOB,
            devices(vec![("GOOD", good), ("BAD", json!({ "user_id": 5 }))]),
            vec![],
        );

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert!(bob.outdated());
        assert_eq!(bob.device_keys().len(), 1);
    }

    #[test]
    fn foreign_identity_uploads_are_rejected() {
        let (mut dir, _store) = directory();
        let (stolen, _, _) = device_json(CAROL, "BOBDEV", 20);
        dir.update_user_keys(BOB, devices(vec![("BOBDEV", stolen)]), vec![]);

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert!(bob.outdated());
        assert!(bob.device_keys().is_empty());
    }

    #[test]
    fn records_round_trip() {
        let (mut dir, _store) = directory();
        let (device_content, _, _) = device_json(BOB, "BOBDEV", 20);
        let (master_content, _, master_pub) = cross_signing_json(BOB, "master", 11);

        let user = UserRecord {
            user_id: BOB.into(),
            outdated: false,
        };
        let device_records = vec![DeviceKeyRecord {
            user_id: BOB.into(),
            device_id: "BOBDEV".into(),
            content: device_content,
            verified: true,
            blocked: false,
            last_active: UnixMillis(1_700_000_000_000),
        }];
        let cross_signing_records = vec![CrossSigningKeyRecord {
            user_id: BOB.into(),
            public_key: master_pub,
            content: master_content,
            verified: false,
            blocked: true,
        }];

        dir.load_user_records(
            user.clone(),
            device_records.clone(),
            cross_signing_records.clone(),
        )
        .unwrap();

        let bundle = dir.user_keys(uid(BOB)).unwrap();
        assert_eq!(
            bundle.to_records(),
            (user, device_records, cross_signing_records)
        );
    }

    #[test]
    fn bundle_lookup_prefers_the_device_table() {
        let (mut dir, _store) = directory();
        let (bob_device, _, _) = device_json(BOB, "BOBDEV", 20);
        let (bob_master, _, bob_master_pub) = cross_signing_json(BOB, "master", 11);
        dir.update_user_keys(
            BOB,
            devices(vec![("BOBDEV", bob_device)]),
            vec![bob_master],
        );

        let bob = dir.user_keys(uid(BOB)).unwrap();
        assert_matches!(bob.get_key("BOBDEV"), Some(crate::keys::KeyRef::Device(_)));
        assert_matches!(
            bob.get_key(&bob_master_pub),
            Some(crate::keys::KeyRef::CrossSigning(_))
        );
        assert_matches!(bob.get_key("missing"), None);
    }
}
