//! SQLite-backed encrypted credential store with scoped entries and
//! rotation history.
//!
//! Every credential is addressed by `(name, scope)`. The scope narrows where
//! a credential applies; a missing scope normalizes to the `"global"`
//! sentinel. Storing under an existing `(name, scope)` pair closes the prior
//! entry's validity window instead of overwriting it, so the full rotation
//! history stays queryable.
//!
//! Secrets are encrypted at rest with a per-entry key (HKDF over the master
//! key and the entry's salt) and only ever surface as a [`SecretHandle`],
//! which redacts itself in `Debug`/`Display` and is not serializable.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::key::MasterKey;

/// Sentinel scope for credentials with no explicit scope.
pub const GLOBAL_SCOPE: &str = "global";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The kind of secret stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Static API key or bearer token.
    ApiKey,
    /// OAuth2 token material.
    OAuth,
    /// Username/password pair.
    BasicAuth,
    /// Anything else (webhook signing secrets, custom headers).
    Custom,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::OAuth => "oauth",
            Self::BasicAuth => "basic_auth",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api_key" => Some(Self::ApiKey),
            "oauth" => Some(Self::OAuth),
            "basic_auth" => Some(Self::BasicAuth),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for a stored credential entry, without the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub scope: String,
    pub kind: CredentialKind,
    pub external_credential_id: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub valid_from: i64,
    pub valid_until: Option<i64>,
    pub last_verified_at: Option<i64>,
    pub created_at: i64,
}

/// A resolved, decrypted secret.
///
/// The secret is reachable only through [`SecretHandle::expose`]. The handle
/// redacts itself in `Debug` and `Display` and deliberately implements
/// neither `Serialize` nor `Clone`, so it cannot wander into provenance
/// entries, audit details, or logs by accident.
pub struct SecretHandle {
    name: String,
    scope: String,
    secret: String,
}

impl SecretHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The decrypted secret. Callers must not persist or log the value.
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretHandle")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl std::fmt::Display for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} <redacted>", self.name, self.scope)
    }
}

/// Normalize an optional scope to its stored form.
pub fn normalize_scope(scope: Option<&str>) -> String {
    match scope.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
        _ => GLOBAL_SCOPE.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Encrypted credential vault backed by SQLite.
pub struct Vault {
    conn: Mutex<Connection>,
    master_key: MasterKey,
}

impl Vault {
    /// Open (or create) a vault database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>, master_key: MasterKey) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening vault database");

        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        let vault = Self {
            conn: Mutex::new(conn),
            master_key,
        };
        vault.migrate()?;
        Ok(vault)
    }

    /// Open an in-memory vault (tests).
    pub fn open_in_memory(master_key: MasterKey) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        let vault = Self {
            conn: Mutex::new(conn),
            master_key,
        };
        vault.migrate()?;
        Ok(vault)
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                id                     TEXT PRIMARY KEY,
                name                   TEXT NOT NULL,
                scope                  TEXT NOT NULL DEFAULT 'global',
                kind                   TEXT NOT NULL CHECK(kind IN ('api_key','oauth','basic_auth','custom')),
                external_credential_id TEXT,
                description            TEXT,
                ciphertext             BLOB NOT NULL,
                salt                   BLOB NOT NULL,
                is_active              BOOLEAN NOT NULL DEFAULT 1,
                valid_from             INTEGER NOT NULL,
                valid_until            INTEGER,
                last_verified_at       INTEGER,
                created_at             INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_name_scope ON credentials(name, scope);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_active
                ON credentials(name, scope) WHERE is_active = 1;",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Internal("vault connection mutex poisoned".into()))
    }

    // -- Store & rotate -----------------------------------------------------

    /// Store a secret under `(name, scope)`.
    ///
    /// If an active entry already exists for the pair, its validity window is
    /// closed (`valid_until = now`, `is_active = 0`) and a fresh entry is
    /// inserted. History is preserved; nothing is deleted.
    pub fn store(
        &self,
        name: &str,
        kind: CredentialKind,
        secret: &str,
        scope: Option<&str>,
        valid_until: Option<i64>,
    ) -> Result<CredentialSummary> {
        let scope = normalize_scope(scope);
        let now = Utc::now().timestamp();

        let salt = crypto::generate_salt()?;
        let entry_key = crypto::derive_entry_key(self.master_key.bytes(), &salt)?;
        let ciphertext = crypto::seal(secret.as_bytes(), &entry_key)?;
        let id = Uuid::now_v7().to_string();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rotated = tx.execute(
            "UPDATE credentials SET is_active = 0, valid_until = ?3 \
             WHERE name = ?1 AND scope = ?2 AND is_active = 1",
            params![name, scope, now],
        )?;

        tx.execute(
            "INSERT INTO credentials (id, name, scope, kind, ciphertext, salt, is_active, \
             valid_from, valid_until, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?7)",
            params![id, name, scope, kind.as_str(), ciphertext, salt.as_slice(), now, valid_until],
        )?;
        tx.commit()?;
        drop(conn);

        tracing::info!(
            credential = name,
            scope = %scope,
            rotated = rotated > 0,
            "stored credential"
        );

        Ok(CredentialSummary {
            id,
            name: name.to_string(),
            scope,
            kind,
            external_credential_id: None,
            description: None,
            is_active: true,
            valid_from: now,
            valid_until,
            last_verified_at: None,
            created_at: now,
        })
    }

    /// Revoke the active entry for `(name, scope)` without replacement.
    pub fn revoke(&self, name: &str, scope: Option<&str>) -> Result<()> {
        let scope = normalize_scope(scope);
        let now = Utc::now().timestamp();

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE credentials SET is_active = 0, valid_until = ?3 \
             WHERE name = ?1 AND scope = ?2 AND is_active = 1",
            params![name, scope, now],
        )?;
        drop(conn);

        if updated == 0 {
            return Err(VaultError::CredentialNotFound {
                name: name.to_string(),
                scope,
            });
        }

        tracing::warn!(credential = name, scope = %scope, "revoked credential");
        Ok(())
    }

    // -- Resolve ------------------------------------------------------------

    /// Resolve and decrypt the credential for `(name, scope)`.
    ///
    /// An entry scoped exactly to `scope` takes precedence over the global
    /// entry for the same name. The match must be active and inside its
    /// validity window; a successful resolve bumps `last_verified_at`.
    pub fn resolve(&self, name: &str, scope: Option<&str>) -> Result<SecretHandle> {
        let requested = normalize_scope(scope);
        let now = Utc::now().timestamp();

        let conn = self.lock()?;

        // Exact scope first, then the global fallback.
        let mut row = Self::active_row(&conn, name, &requested)?;
        if row.is_none() && requested != GLOBAL_SCOPE {
            row = Self::active_row(&conn, name, GLOBAL_SCOPE)?;
        }

        let Some(row) = row else {
            drop(conn);
            // Distinguish "never stored" from "revoked and not replaced".
            let revoked = self.has_inactive(name, &requested)?;
            return Err(if revoked {
                VaultError::CredentialRevoked {
                    name: name.to_string(),
                    scope: requested,
                }
            } else {
                VaultError::CredentialNotFound {
                    name: name.to_string(),
                    scope: requested,
                }
            });
        };

        if row.valid_from > now || row.valid_until.is_some_and(|until| until <= now) {
            return Err(VaultError::CredentialExpired {
                name: name.to_string(),
                scope: row.scope,
            });
        }

        conn.execute(
            "UPDATE credentials SET last_verified_at = ?2 WHERE id = ?1",
            params![row.id, now],
        )?;
        drop(conn);

        let entry_key = crypto::derive_entry_key(self.master_key.bytes(), &row.salt)?;
        let plaintext = crypto::open(&row.ciphertext, &entry_key)?;
        let secret = String::from_utf8(plaintext)
            .map_err(|_| VaultError::DecryptionFailed {
                reason: "decrypted secret is not valid UTF-8".into(),
            })?;

        tracing::debug!(credential = name, scope = %row.scope, "resolved credential");

        Ok(SecretHandle {
            name: name.to_string(),
            scope: row.scope,
            secret,
        })
    }

    /// Check that `(name, scope)` resolves without returning the secret.
    pub fn verify(&self, name: &str, scope: Option<&str>) -> Result<()> {
        self.resolve(name, scope).map(|_| ())
    }

    // -- Queries ------------------------------------------------------------

    /// All active credential entries, without secrets.
    pub fn list(&self) -> Result<Vec<CredentialSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, scope, kind, external_credential_id, description, is_active, \
             valid_from, valid_until, last_verified_at, created_at \
             FROM credentials WHERE is_active = 1 ORDER BY name, scope",
        )?;
        let rows = stmt
            .query_map([], summary_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full rotation history for `(name, scope)`, newest first.
    pub fn history(&self, name: &str, scope: Option<&str>) -> Result<Vec<CredentialSummary>> {
        let scope = normalize_scope(scope);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, scope, kind, external_credential_id, description, is_active, \
             valid_from, valid_until, last_verified_at, created_at \
             FROM credentials WHERE name = ?1 AND scope = ?2 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![name, scope], summary_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Internals ----------------------------------------------------------

    fn active_row(conn: &Connection, name: &str, scope: &str) -> Result<Option<ActiveRow>> {
        let row = conn
            .query_row(
                "SELECT id, scope, ciphertext, salt, valid_from, valid_until \
                 FROM credentials WHERE name = ?1 AND scope = ?2 AND is_active = 1",
                params![name, scope],
                |row| {
                    Ok(ActiveRow {
                        id: row.get(0)?,
                        scope: row.get(1)?,
                        ciphertext: row.get(2)?,
                        salt: row.get(3)?,
                        valid_from: row.get(4)?,
                        valid_until: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn has_inactive(&self, name: &str, scope: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE name = ?1 AND scope IN (?2, 'global')",
            params![name, scope],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

struct ActiveRow {
    id: String,
    scope: String,
    ciphertext: Vec<u8>,
    salt: Vec<u8>,
    valid_from: i64,
    valid_until: Option<i64>,
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialSummary> {
    let kind: String = row.get(3)?;
    Ok(CredentialSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        scope: row.get(2)?,
        kind: CredentialKind::parse(&kind).unwrap_or(CredentialKind::Custom),
        external_credential_id: row.get(4)?,
        description: row.get(5)?,
        is_active: row.get(6)?,
        valid_from: row.get(7)?,
        valid_until: row.get(8)?,
        last_verified_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn test_vault() -> Vault {
        Vault::open_in_memory(MasterKey::from_bytes([42u8; KEY_LEN])).unwrap()
    }

    #[test]
    fn store_and_resolve() {
        let vault = test_vault();
        vault
            .store("slack-token", CredentialKind::ApiKey, "xoxb-123", Some("slack"), None)
            .unwrap();

        let handle = vault.resolve("slack-token", Some("slack")).unwrap();
        assert_eq!(handle.expose(), "xoxb-123");
        assert_eq!(handle.scope(), "slack");
    }

    #[test]
    fn missing_credential_not_found() {
        let vault = test_vault();
        let result = vault.resolve("nope", None);
        assert!(matches!(result, Err(VaultError::CredentialNotFound { .. })));
    }

    #[test]
    fn scope_normalizes_to_global() {
        let vault = test_vault();
        vault
            .store("api-key", CredentialKind::ApiKey, "k1", None, None)
            .unwrap();

        let entries = vault.list().unwrap();
        assert_eq!(entries[0].scope, GLOBAL_SCOPE);
        // Blank scopes normalize too.
        assert_eq!(vault.resolve("api-key", Some("  ")).unwrap().scope(), GLOBAL_SCOPE);
    }

    #[test]
    fn exact_scope_beats_global() {
        let vault = test_vault();
        vault
            .store("token", CredentialKind::ApiKey, "global-value", None, None)
            .unwrap();
        vault
            .store("token", CredentialKind::ApiKey, "scoped-value", Some("slack"), None)
            .unwrap();

        assert_eq!(vault.resolve("token", Some("slack")).unwrap().expose(), "scoped-value");
        assert_eq!(vault.resolve("token", Some("github")).unwrap().expose(), "global-value");
        assert_eq!(vault.resolve("token", None).unwrap().expose(), "global-value");
    }

    #[test]
    fn rotation_closes_prior_entry() {
        let vault = test_vault();
        vault
            .store("token", CredentialKind::ApiKey, "old", Some("slack"), None)
            .unwrap();
        vault
            .store("token", CredentialKind::ApiKey, "new", Some("slack"), None)
            .unwrap();

        // Resolve returns the newest active entry.
        assert_eq!(vault.resolve("token", Some("slack")).unwrap().expose(), "new");

        // History preserves both; the old one is closed, not deleted.
        let history = vault.history("token", Some("slack")).unwrap();
        assert_eq!(history.len(), 2);
        let old = history.iter().find(|e| !e.is_active).unwrap();
        assert!(old.valid_until.is_some());
    }

    #[test]
    fn expired_credential_rejected() {
        let vault = test_vault();
        let past = Utc::now().timestamp() - 60;
        vault
            .store("token", CredentialKind::ApiKey, "v", None, Some(past))
            .unwrap();

        let result = vault.resolve("token", None);
        assert!(matches!(result, Err(VaultError::CredentialExpired { .. })));
    }

    #[test]
    fn revoked_credential_rejected() {
        let vault = test_vault();
        vault
            .store("token", CredentialKind::ApiKey, "v", None, None)
            .unwrap();
        vault.revoke("token", None).unwrap();

        let result = vault.resolve("token", None);
        assert!(matches!(result, Err(VaultError::CredentialRevoked { .. })));
    }

    #[test]
    fn resolve_bumps_last_verified() {
        let vault = test_vault();
        vault
            .store("token", CredentialKind::ApiKey, "v", None, None)
            .unwrap();
        assert!(vault.list().unwrap()[0].last_verified_at.is_none());

        vault.resolve("token", None).unwrap();
        assert!(vault.list().unwrap()[0].last_verified_at.is_some());
    }

    #[test]
    fn handle_redacts_secret() {
        let vault = test_vault();
        vault
            .store("token", CredentialKind::ApiKey, "super-secret", None, None)
            .unwrap();

        let handle = vault.resolve("token", None).unwrap();
        let debug = format!("{handle:?}");
        let display = format!("{handle}");
        assert!(!debug.contains("super-secret"));
        assert!(!display.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vault.db");
        let key = MasterKey::from_bytes([7u8; KEY_LEN]);

        {
            let vault = Vault::open(&db_path, key).unwrap();
            vault
                .store("token", CredentialKind::ApiKey, "persisted", None, None)
                .unwrap();
        }

        let vault = Vault::open(&db_path, MasterKey::from_bytes([7u8; KEY_LEN])).unwrap();
        assert_eq!(vault.resolve("token", None).unwrap().expose(), "persisted");

        // The wrong master key cannot decrypt.
        let wrong = Vault::open(&db_path, MasterKey::from_bytes([8u8; KEY_LEN])).unwrap();
        assert!(wrong.resolve("token", None).is_err());
    }
}
