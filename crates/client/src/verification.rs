use async_trait::async_trait;

use crate::core::{OwnedDeviceId, OwnedRoomId, OwnedUserId, UserId};
use crate::directory::KeyDirectory;
use crate::error::{Error, Result};

/// Parameters of a verification session about to start.
#[derive(Clone, Debug)]
pub struct NewVerification {
    /// The user being verified.
    pub user_id: OwnedUserId,

    /// The room the verification runs in; absent for broadcast sessions.
    pub room_id: Option<OwnedRoomId>,

    /// The target device; `"*"` addresses all of the user's devices.
    pub device_id: Option<OwnedDeviceId>,
}

/// A started verification session, driven by the external session machine.
#[derive(Clone, Debug)]
pub struct VerificationHandle {
    /// Transaction ID identifying the session on the wire.
    pub transaction_id: String,

    /// The parameters the session was started with.
    pub request: NewVerification,
}

/// The surrounding client pieces needed to start an interactive
/// verification. The session machine itself lives behind this trait.
#[async_trait]
pub trait VerificationBackend: Send + Sync {
    /// Returns the direct chat shared with the given user, creating one if
    /// needed. `None` means no room could be obtained.
    async fn direct_chat(&self, user_id: &UserId) -> Result<Option<OwnedRoomId>>;

    /// Creates a verification session and starts it.
    fn begin(&self, request: NewVerification) -> VerificationHandle;

    /// Registers a broadcast session with the verification manager.
    fn register(&self, handle: &VerificationHandle);
}

impl KeyDirectory {
    /// Starts an interactive verification with the given user.
    ///
    /// Verifying another user runs in the shared direct chat; verifying the
    /// own account broadcasts to all of its devices and registers the
    /// session with the verification manager.
    pub async fn start_verification(
        &self,
        backend: &dyn VerificationBackend,
        user_id: &UserId,
    ) -> Result<VerificationHandle> {
        if user_id != self.self_user_id() {
            let room_id = backend
                .direct_chat(user_id)
                .await?
                .ok_or_else(|| Error::RoomCreationFailed(user_id.to_owned()))?;
            Ok(backend.begin(NewVerification {
                user_id: user_id.to_owned(),
                room_id: Some(room_id),
                device_id: None,
            }))
        } else {
            let handle = backend.begin(NewVerification {
                user_id: user_id.to_owned(),
                room_id: None,
                device_id: Some("*".into()),
            });
            backend.register(&handle);
            Ok(handle)
        }
    }
}
