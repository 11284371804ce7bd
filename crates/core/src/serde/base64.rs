//! Base64 helpers using the standard character set without padding, as used
//! for key material and signatures on the wire.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

/// Encodes bytes with the standard alphabet, without padding.
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Decodes standard-alphabet base64.
///
/// Unpadded input is the canonical form, but padded input from misbehaving
/// peers is accepted as well.
pub fn decode(s: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD
        .decode(s)
        .or_else(|_| STANDARD.decode(s))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::{decode, encode};

    #[test]
    fn encode_unpadded() {
        assert_eq!(encode(b"base64"), "YmFzZTY0");
        assert_eq!(encode(b"a"), "YQ");
    }

    #[test]
    fn decode_accepts_both_forms() {
        assert_eq!(decode("YQ").unwrap(), b"a");
        assert_eq!(decode("YQ==").unwrap(), b"a");
        assert!(decode("not base64!").is_none());
    }
}
