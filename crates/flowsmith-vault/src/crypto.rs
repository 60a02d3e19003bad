//! Cryptographic primitives for the vault, built on `ring`.
//!
//! - **Sealing**: AES-256-GCM with a random 96-bit nonce per operation. The
//!   nonce is prepended to the ciphertext so a sealed blob is self-contained.
//! - **Master key**: PBKDF2-HMAC-SHA256 over an operator passphrase with a
//!   stored random salt (600,000 iterations, OWASP 2023 figure).
//! - **Entry keys**: each credential row carries its own salt; the row's
//!   encryption key is derived from the master key and that salt via
//!   HKDF-SHA256, so rotating a credential never reuses a key.

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::{hkdf, pbkdf2};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, VaultError};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Per-entry salt length in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2 iteration count for the master passphrase.
const PBKDF2_ITERATIONS: u32 = 600_000;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// HKDF info label binding entry keys to this use.
const ENTRY_KEY_INFO: &[&[u8]] = &[b"flowsmith-credential-v1"];

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// Yields exactly one nonce, then errors. Each bound key is used once.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under `key`, returning `nonce || ciphertext || tag`.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut sealing = SealingKey::new(unbound, SingleNonce(Some(nonce_bytes)));

    let mut blob = Vec::with_capacity(NONCE_LEN + plaintext.len() + AEAD_ALG.tag_len());
    blob.extend_from_slice(&nonce_bytes);
    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;
    blob.extend_from_slice(&in_out);

    Ok(blob)
}

/// Decrypt a blob produced by [`seal`].
pub fn open(blob: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN + AEAD_ALG.tag_len() {
        return Err(VaultError::DecryptionFailed {
            reason: format!("sealed blob too short: {} bytes", blob.len()),
        });
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&blob[..NONCE_LEN]);

    let unbound = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::DecryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut opening = OpeningKey::new(unbound, SingleNonce(Some(nonce_bytes)));

    let mut in_out = blob[NONCE_LEN..].to_vec();
    let plaintext = opening
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "authentication failed — wrong key or corrupted data".into(),
        })?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive the master key from an operator passphrase and a stored salt.
///
/// Deterministic: the same passphrase and salt always yield the same key.
pub fn derive_master_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let iterations = std::num::NonZeroU32::new(PBKDF2_ITERATIONS)
        .ok_or_else(|| VaultError::KeyDerivationFailed {
            reason: "iteration count must be non-zero".into(),
        })?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, passphrase, &mut key);
    Ok(key)
}

/// Derive a per-entry key from the master key and the entry's salt.
pub fn derive_entry_key(master_key: &[u8; KEY_LEN], entry_salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, entry_salt);
    let prk = salt.extract(master_key);
    let okm = prk
        .expand(ENTRY_KEY_INFO, hkdf::HKDF_SHA256)
        .map_err(|_| VaultError::KeyDerivationFailed {
            reason: "HKDF expand failed".into(),
        })?;

    let mut key = [0u8; KEY_LEN];
    okm.fill(&mut key)
        .map_err(|_| VaultError::KeyDerivationFailed {
            reason: "HKDF fill failed".into(),
        })?;
    Ok(key)
}

/// Generate a fresh random salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| VaultError::Internal("failed to generate random salt".into()))?;
    Ok(salt)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_LEN] {
        derive_master_key(b"test passphrase", b"fixed test salt").unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let blob = seal(b"hook-secret-12345", &key).unwrap();
        assert_eq!(open(&blob, &key).unwrap(), b"hook-secret-12345");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let key = test_key();
        let other = derive_master_key(b"other passphrase", b"fixed test salt").unwrap();

        let blob = seal(b"secret", &key).unwrap();
        assert!(open(&blob, &other).is_err());
    }

    #[test]
    fn tampered_blob_fails() {
        let key = test_key();
        let mut blob = seal(b"secret", &key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open(&blob, &key).is_err());
    }

    #[test]
    fn truncated_blob_rejected() {
        let key = test_key();
        assert!(open(&[0u8; 8], &key).is_err());
    }

    #[test]
    fn master_key_is_deterministic() {
        let a = derive_master_key(b"pass", b"salt-1").unwrap();
        let b = derive_master_key(b"pass", b"salt-1").unwrap();
        let c = derive_master_key(b"pass", b"salt-2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn entry_keys_differ_per_salt() {
        let master = test_key();
        let s1 = generate_salt().unwrap();
        let s2 = generate_salt().unwrap();

        let k1 = derive_entry_key(&master, &s1).unwrap();
        let k2 = derive_entry_key(&master, &s2).unwrap();
        assert_ne!(k1, k2);
        // And are stable for the same salt.
        assert_eq!(k1, derive_entry_key(&master, &s1).unwrap());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = test_key();
        let blob = seal(b"", &key).unwrap();
        assert_eq!(open(&blob, &key).unwrap(), b"");
    }
}
