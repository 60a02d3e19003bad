//! Vault error types.

use thiserror::Error;

/// Errors produced by the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential not found: {name} (scope: {scope})")]
    CredentialNotFound { name: String, scope: String },

    #[error("credential expired: {name} (scope: {scope})")]
    CredentialExpired { name: String, scope: String },

    #[error("credential revoked: {name} (scope: {scope})")]
    CredentialRevoked { name: String, scope: String },

    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal vault error: {0}")]
    Internal(String),
}

/// Convenience result alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
