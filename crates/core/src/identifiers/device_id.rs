opaque_identifier! {
    /// A Matrix-style device ID.
    ///
    /// Device identifiers are completely opaque character sequences. This
    /// type is provided simply for its semantic value.
    pub struct DeviceId, OwnedDeviceId;
}
