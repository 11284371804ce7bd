use thiserror::Error;

use crate::core::OwnedUserId;
use crate::core::serde::CanonicalJsonError;
use crate::store::StoreError;

/// Errors surfaced by the trust runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// A verify or block mutation was invoked on an unusable cross-signing
    /// key.
    #[error("invalid key: `{0}`")]
    InvalidKey(String),

    /// No direct chat could be obtained to run a verification in.
    #[error("no direct chat could be obtained with `{0}`")]
    RoomCreationFailed(OwnedUserId),

    #[error("store: `{0}`")]
    Store(#[from] StoreError),

    #[error("canonical json: `{0}`")]
    CanonicalJson(#[from] CanonicalJsonError),

    #[error("serde json: `{0}`")]
    SerdeJson(#[from] serde_json::Error),
}

/// Shorthand result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;
