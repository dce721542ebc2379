//! Byte buffer that serializes as lowercase hexadecimal.
//!
//! Block bytecode travels through JSON (`bytecodeHex` in disassembler output and CFG snapshots),
//! so the wrapper keeps serde and `Debug` output readable while derefing to a plain slice.

use crate::normalize_hex_string;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Deref;

/// Wrapper around `Vec<u8>` that renders as contiguous lowercase hex.
///
/// # Examples
///
/// ```
/// use sieve_core::HexBytes;
///
/// let bytes = HexBytes(vec![0x60, 0x00, 0xfe]);
/// assert_eq!(format!("{bytes:?}"), "6000fe");
/// assert_eq!(serde_json::to_string(&bytes).unwrap(), "\"6000fe\"");
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for HexBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for HexBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for HexBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl Serialize for HexBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexBytesVisitor;

        impl Visitor<'_> for HexBytesVisitor {
            type Value = HexBytes;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a hex string, optionally 0x-prefixed")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let normalized = normalize_hex_string(v).map_err(E::custom)?;
                let bytes = hex::decode(&normalized).map_err(E::custom)?;
                Ok(HexBytes(bytes))
            }
        }

        deserializer.deserialize_str(HexBytesVisitor)
    }
}

impl PartialEq<Vec<u8>> for HexBytes {
    fn eq(&self, other: &Vec<u8>) -> bool {
        &self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::HexBytes;

    #[test]
    fn accepts_prefixed_uppercase_input() {
        let parsed: HexBytes = serde_json::from_str("\"0x6000FE\"").expect("valid hex");
        assert_eq!(parsed, vec![0x60, 0x00, 0xfe]);
        assert_eq!(parsed.to_string(), "0x6000fe");
    }

    #[test]
    fn rejects_odd_length() {
        assert!(serde_json::from_str::<HexBytes>("\"abc\"").is_err());
    }
}
