use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::StorageError;

/// A validated SHA-256 content fingerprint.
///
/// The fingerprint is the natural identity of stored content: two byte
/// sequences share a fingerprint exactly when they are identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of the given bytes in one shot.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    /// Construct from raw SHA-256 bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex-encoded fingerprint.
    pub fn from_hex(s: &str) -> Result<Self, StorageError> {
        if s.len() != 64 {
            return Err(StorageError::InvalidKey(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }

        let bytes =
            hex::decode(s).map_err(|e| StorageError::InvalidKey(format!("invalid hex: {e}")))?;

        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StorageError::InvalidKey("decoded to wrong length".into()))?;

        Ok(Self(arr))
    }

    /// Return the fingerprint as a 64-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the object-store key for this fingerprint.
    ///
    /// Layout: `files/<fp[0:2]>/<fp[2:4]>/<fp>`. The two-level fan-out
    /// bounds any directory to 65 536 children.
    pub fn storage_key(&self) -> String {
        let hex = self.to_hex();
        format!("files/{}/{}/{}", &hex[..2], &hex[2..4], &hex)
    }

    /// Recover a fingerprint from a `files/aa/bb/<hex>` storage key.
    ///
    /// Returns `None` for keys outside the content-addressed layout.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("files/")?;
        let mut parts = rest.splitn(3, '/');
        let p1 = parts.next()?;
        let p2 = parts.next()?;
        let hex = parts.next()?;
        if p1.len() != 2 || p2.len() != 2 || hex.len() != 64 {
            return None;
        }
        if !hex.starts_with(p1) || hex[2..4] != *p2 {
            return None;
        }
        Self::from_hex(hex).ok()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental fingerprint computation for streamed content.
///
/// Feed chunks as they arrive; `finalize` yields the fingerprint of the
/// concatenated stream.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}
