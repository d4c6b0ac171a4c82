//! WireGuard key encoding
//!
//! Keys arrive base64 encoded (the format `wg genkey` prints) and are
//! handed to the device as lowercase hex.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Length of a Curve25519 key in bytes
pub const KEY_LEN: usize = 32;

/// Convert a base64 key to its lowercase hex wire form.
pub fn to_wire_format(encoded: &str) -> Result<String, KeyError> {
    let bytes = BASE64.decode(encoded).map_err(|_| KeyError::InvalidBase64)?;
    Ok(hex::encode(bytes))
}

/// Decode a hex wire key into raw key bytes.
pub fn from_wire_format(wire: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = hex::decode(wire).map_err(|_| KeyError::InvalidHex)?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 key encoding")]
    InvalidBase64,

    #[error("invalid hex key encoding")]
    InvalidHex,

    #[error("invalid key length {0} (expected 32 bytes)")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_lowercase_hex() {
        // 32 bytes 0x00..=0x1f
        let raw: Vec<u8> = (0u8..32).collect();
        let encoded = BASE64.encode(&raw);

        let wire = to_wire_format(&encoded).unwrap();
        assert_eq!(wire.len(), 64);
        assert_eq!(
            wire,
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
        );
        assert_eq!(from_wire_format(&wire).unwrap().to_vec(), raw);
    }

    #[test]
    fn test_uppercase_bytes_encode_lowercase() {
        let wire = to_wire_format("/w==").unwrap();
        assert_eq!(wire, "ff");
    }

    #[test]
    fn test_invalid_base64_fails() {
        assert_eq!(
            to_wire_format("not-valid-base64!!!"),
            Err(KeyError::InvalidBase64)
        );
        // truncated padding
        assert_eq!(to_wire_format("AAE"), Err(KeyError::InvalidBase64));
    }

    #[test]
    fn test_wire_key_length_checked() {
        assert_eq!(from_wire_format("abcd"), Err(KeyError::InvalidLength(2)));
        assert_eq!(from_wire_format("zz"), Err(KeyError::InvalidHex));
    }
}
