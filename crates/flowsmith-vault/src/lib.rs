//! # flowsmith-vault
//!
//! Encrypted credential vault for Flowsmith.
//!
//! Credentials are addressed by `(name, scope)` with a `"global"` sentinel
//! scope, encrypted at rest with AES-256-GCM under per-entry keys derived
//! from a passphrase-based master key, and rotated by closing the prior
//! entry's validity window rather than overwriting it.
//!
//! ## Quick start
//!
//! ```ignore
//! use flowsmith_vault::{CredentialKind, MasterKey, Vault};
//!
//! let key = MasterKey::from_passphrase(&passphrase, "data/vault.salt")?;
//! let vault = Vault::open("data/vault.db", key)?;
//!
//! vault.store("slack-token", CredentialKind::ApiKey, "xoxb-...", Some("slack"), None)?;
//! let handle = vault.resolve("slack-token", Some("slack"))?;
//! ```

pub mod crypto;
pub mod error;
pub mod key;
pub mod store;

// ── re-exports ───────────────────────────────────────────────────────

pub use error::{Result, VaultError};
pub use key::MasterKey;
pub use store::{
    CredentialKind, CredentialSummary, GLOBAL_SCOPE, SecretHandle, Vault, normalize_scope,
};
