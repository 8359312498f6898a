use num_bigint::BigUint;
use num_traits::Num;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serializer};

/// Render a big integer as a 0x-prefixed lowercase hex string.
pub fn biguint_to_hex(value: &BigUint) -> String {
    format!("0x{}", value.to_str_radix(16))
}

/// Parse a hex string with an optional 0x prefix.
pub fn biguint_from_hex(s: &str) -> Result<BigUint, String> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err("empty hex string".to_string());
    }
    BigUint::from_str_radix(digits, 16).map_err(|err| format!("invalid hex integer: {err}"))
}

/// Serde helpers for encoding `BigUint` as 0x-prefixed hex strings.
pub mod biguint {
    use super::*;

    pub fn serialize<S>(value: &BigUint, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&biguint_to_hex(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        biguint_from_hex(&s).map_err(DeError::custom)
    }
}

/// Serde helpers for fixed 32-byte digests encoded as hex strings.
pub mod digest32 {
    use super::*;

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_digest32(&s).map_err(DeError::custom)
    }
}

pub fn parse_digest32(s: &str) -> Result<[u8; 32], String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|err| format!("invalid hex digest: {err}"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
}

/// Serde helpers for `Duration` values stored as integer milliseconds.
pub mod duration_ms {
    use super::*;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
