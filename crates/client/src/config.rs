use serde::Deserialize;

fn default_true() -> bool {
    true
}

/// Behavior switches of the trust runtime.
#[derive(Clone, Debug, Deserialize)]
pub struct EncryptionConfig {
    /// Whether end-to-end encryption is enabled at all.
    ///
    /// When false, every signature chain evaluation fails immediately.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether encrypting to a device is permitted while its owner's master
    /// key is not verified.
    ///
    /// On by default so that first contact with a user whose identity has
    /// not been anchored yet does not deadlock. Deployments with a stricter
    /// security posture can turn this off.
    #[serde(default = "default_true")]
    pub optimistic_encryption: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            optimistic_encryption: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EncryptionConfig;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: EncryptionConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert!(config.optimistic_encryption);

        let config: EncryptionConfig =
            serde_json::from_str(r#"{ "optimistic_encryption": false }"#).unwrap();
        assert!(config.enabled);
        assert!(!config.optimistic_encryption);
    }
}
