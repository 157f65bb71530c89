//! Node identities and truncated-hash addressing.
//!
//! An identity is a blob of long-lived key material; everything that needs an
//! address on the overlay (identities themselves, destinations, links) is
//! referred to by a truncated SHA-256 hash. Addresses print as lowercase hex.

use std::fmt;
use std::path::Path;

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Width of a truncated address hash.
pub const TRUNCATED_HASH_BITS: usize = 128;
/// Truncated hash width in bytes.
pub const TRUNCATED_HASH_BYTES: usize = TRUNCATED_HASH_BITS / 8;

const SECRET_LEN: usize = 32;

/// A truncated hash identifying an identity or a destination on the overlay.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressHash([u8; TRUNCATED_HASH_BYTES]);

impl AddressHash {
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut out = [0u8; TRUNCATED_HASH_BYTES];
        out.copy_from_slice(&digest[..TRUNCATED_HASH_BYTES]);
        Self(out)
    }

    /// Parse from hex. The input must be exactly the truncated hash length.
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        if s.len() != TRUNCATED_HASH_BYTES * 2 {
            return Err(AddressError::Length {
                hex: TRUNCATED_HASH_BYTES * 2,
                bytes: TRUNCATED_HASH_BYTES,
            });
        }
        let raw = hex::decode(s).map_err(|_| AddressError::NotHex)?;
        Ok(Self::from_digest(&raw))
    }

    pub fn as_bytes(&self) -> &[u8; TRUNCATED_HASH_BYTES] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.hex())
    }
}

impl Serialize for AddressHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for AddressHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AddressHash::from_hex(&s).map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("destination length is invalid, must be {hex} hexadecimal characters ({bytes} bytes)")]
    Length { hex: usize, bytes: usize },
    #[error("invalid destination entered, check your input")]
    NotHex,
}

/// Long-lived key material identifying one node.
///
/// Key cryptography is the overlay's concern; the shell only needs stable
/// key bytes to persist and a truncated hash to route by.
pub struct Identity {
    secret: [u8; SECRET_LEN],
    hash: AddressHash,
}

impl Identity {
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    fn from_secret(secret: [u8; SECRET_LEN]) -> Self {
        let digest = Sha256::digest(secret);
        Self {
            secret,
            hash: AddressHash::from_digest(&digest),
        }
    }

    /// Load an identity from a file of raw key material.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        if raw.len() < SECRET_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("identity file {} is truncated", path.display()),
            ));
        }
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&raw[..SECRET_LEN]);
        Ok(Self::from_secret(secret))
    }

    /// Persist the key material, readable by the owner only.
    pub fn to_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.secret)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn hash(&self) -> AddressHash {
        self.hash
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.hash.hex())
    }
}

/// Hash addressing a (identity, app name, service name) destination.
pub fn destination_hash(identity: AddressHash, app_name: &str, service_name: &str) -> AddressHash {
    let name_digest = Sha256::digest(format!("{app_name}.{service_name}").as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(name_digest);
    hasher.update(identity.as_bytes());
    AddressHash::from_digest(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let identity = Identity::generate();
        let hash = identity.hash();
        assert_eq!(AddressHash::from_hex(&hash.hex()).unwrap(), hash);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = AddressHash::from_hex("abcd").unwrap_err();
        assert!(err.to_string().contains("hexadecimal characters"));
    }

    #[test]
    fn rejects_non_hex() {
        let err = AddressHash::from_hex(&"zz".repeat(16)).unwrap_err();
        assert!(matches!(err, AddressError::NotHex));
    }

    #[test]
    fn destination_hash_depends_on_service() {
        let id = Identity::generate().hash();
        let a = destination_hash(id, "rnsh", "default");
        let b = destination_hash(id, "rnsh", "other");
        assert_ne!(a, b);
    }

    #[test]
    fn identity_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        let identity = Identity::generate();
        identity.to_file(&path).unwrap();
        let reloaded = Identity::from_file(&path).unwrap();
        assert_eq!(reloaded.hash(), identity.hash());
    }
}
