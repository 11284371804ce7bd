use async_trait::async_trait;

use crate::core::{JsonValue, OwnedUserId};
use crate::error::Result;

/// A key handed to the cross-signing component for co-signing.
#[derive(Clone, Debug)]
pub struct SigningTarget {
    /// The user the key belongs to.
    pub user_id: OwnedUserId,

    /// The key's identifier: device ID or cross-signing public key.
    pub key_id: String,

    /// The upstream JSON form of the key.
    pub content: JsonValue,
}

/// The local cross-signing component.
///
/// The directory asks `signable` before dispatching `sign`; the sign call
/// itself runs fire-and-forget and its failure is logged, never surfaced.
#[async_trait]
pub trait CrossSigningDelegate: Send + Sync {
    /// Whether the component is able to co-sign the given keys.
    fn signable(&self, targets: &[SigningTarget]) -> bool;

    /// Signs the given keys and uploads the signatures.
    async fn sign(&self, targets: Vec<SigningTarget>) -> Result<()>;
}

/// Inert stand-in used when no cross-signing component is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCrossSigning;

#[async_trait]
impl CrossSigningDelegate for NoCrossSigning {
    fn signable(&self, _targets: &[SigningTarget]) -> bool {
        false
    }

    async fn sign(&self, _targets: Vec<SigningTarget>) -> Result<()> {
        Ok(())
    }
}
