//! Master key management.
//!
//! The vault's master key is derived from an operator passphrase and a random
//! salt persisted next to the vault database. The salt file is created on
//! first use; losing it (or the passphrase) makes existing ciphertext
//! unrecoverable.

use std::path::Path;

use crate::crypto::{self, KEY_LEN, SALT_LEN};
use crate::error::{Result, VaultError};

/// A derived master key. Never printed, never serialized.
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Derive the master key from `passphrase`, loading the salt from
    /// `salt_path` or creating it on first use.
    pub fn from_passphrase(passphrase: &str, salt_path: impl AsRef<Path>) -> Result<Self> {
        let salt_path = salt_path.as_ref();
        let salt = if salt_path.exists() {
            let bytes = std::fs::read(salt_path)?;
            if bytes.len() != SALT_LEN {
                return Err(VaultError::KeyDerivationFailed {
                    reason: format!(
                        "salt file {} is {} bytes, expected {}",
                        salt_path.display(),
                        bytes.len(),
                        SALT_LEN
                    ),
                });
            }
            bytes
        } else {
            let salt = crypto::generate_salt()?;
            std::fs::write(salt_path, salt)?;
            tracing::info!(path = %salt_path.display(), "created new vault salt file");
            salt.to_vec()
        };

        let key = crypto::derive_master_key(passphrase.as_bytes(), &salt)?;
        Ok(Self(key))
    }

    /// Construct from raw key bytes (tests and external key sources).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}
