opaque_identifier! {
    /// A Matrix-style room ID.
    pub struct RoomId, OwnedRoomId;
}
