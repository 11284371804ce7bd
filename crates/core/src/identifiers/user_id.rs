opaque_identifier! {
    /// A Matrix-style user ID.
    ///
    /// User IDs are treated as opaque character sequences; a key owned by an
    /// empty user ID simply never becomes valid.
    pub struct UserId, OwnedUserId;
}
