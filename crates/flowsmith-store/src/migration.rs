//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number. Applied
//! versions are tracked in a `_migrations` table so that `run_all` is
//! idempotent and only ever applies each migration once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Append new migrations to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "knowledge base — documents, chunk embeddings, pattern library, store metadata",
        sql: r#"
            CREATE TABLE documents (
                id               TEXT PRIMARY KEY,
                source           TEXT NOT NULL CHECK(source IN ('template','doc-page','transcript','pattern','manual','custom')),
                url              TEXT,
                title            TEXT NOT NULL,
                content          TEXT NOT NULL,
                metadata         TEXT NOT NULL DEFAULT '{}',
                fingerprint      TEXT NOT NULL UNIQUE,
                content_hash     TEXT NOT NULL,
                freshness_score  REAL NOT NULL DEFAULT 1.0,
                embed_state      TEXT NOT NULL DEFAULT 'pending' CHECK(embed_state IN ('pending','embedded','failed')),
                embed_attempts   INTEGER NOT NULL DEFAULT 0,
                superseded_by    TEXT REFERENCES documents(id),
                last_ingested_at INTEGER NOT NULL,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );
            CREATE INDEX idx_documents_embed_state ON documents(embed_state);
            CREATE INDEX idx_documents_source ON documents(source);

            CREATE TABLE chunk_embeddings (
                document_id TEXT NOT NULL REFERENCES documents(id),
                chunk_index INTEGER NOT NULL,
                chunk_text  TEXT NOT NULL,
                vector      BLOB NOT NULL,
                dimension   INTEGER NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (document_id, chunk_index)
            );

            CREATE TABLE pattern_entries (
                id                  TEXT PRIMARY KEY,
                name                TEXT NOT NULL UNIQUE,
                category            TEXT NOT NULL CHECK(category IN ('error-handling','retry-logic','transformation','integration','security','performance','general')),
                description         TEXT NOT NULL,
                example_config      TEXT,
                source_document_ids TEXT NOT NULL DEFAULT '[]',
                usage_count         INTEGER NOT NULL DEFAULT 0,
                confidence          REAL NOT NULL DEFAULT 0.5 CHECK(confidence >= 0.0 AND confidence <= 1.0),
                anti_pattern        BOOLEAN NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                updated_at          INTEGER NOT NULL
            );
            CREATE INDEX idx_pattern_entries_category ON pattern_entries(category);

            CREATE TABLE store_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        description: "generation pipeline — workflows, executions, generation jobs",
        sql: r#"
            CREATE TABLE workflows (
                id                   TEXT PRIMARY KEY,
                name                 TEXT NOT NULL,
                user_goal            TEXT NOT NULL,
                config               TEXT,
                external_workflow_id TEXT,
                status               TEXT NOT NULL DEFAULT 'created' CHECK(status IN ('created','validated','staged','active','failed','archived')),
                validation_errors    TEXT NOT NULL DEFAULT '[]',
                best_practices_score REAL,
                test_results         TEXT,
                provenance           TEXT NOT NULL DEFAULT '[]',
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL,
                staged_at            INTEGER,
                activated_at         INTEGER
            );
            CREATE INDEX idx_workflows_status ON workflows(status);

            CREATE TABLE executions (
                id                    TEXT PRIMARY KEY,
                workflow_id           TEXT NOT NULL REFERENCES workflows(id),
                external_execution_id TEXT,
                status                TEXT NOT NULL CHECK(status IN ('running','success','error','waiting','canceled')),
                mode                  TEXT NOT NULL CHECK(mode IN ('test','staging','production')),
                started_at            INTEGER NOT NULL,
                finished_at           INTEGER,
                error_message         TEXT,
                payload               TEXT,
                test_payload          TEXT
            );
            CREATE INDEX idx_executions_workflow ON executions(workflow_id);

            CREATE TABLE generation_jobs (
                id             TEXT PRIMARY KEY,
                status         TEXT NOT NULL DEFAULT 'queued' CHECK(status IN ('queued','running','succeeded','failed')),
                request        TEXT NOT NULL,
                worker         TEXT,
                workflow_id    TEXT REFERENCES workflows(id),
                failure_reason TEXT,
                result         TEXT,
                submitted_at   INTEGER NOT NULL,
                started_at     INTEGER,
                finished_at    INTEGER
            );
            CREATE INDEX idx_generation_jobs_status ON generation_jobs(status);
        "#,
    },
    Migration {
        version: 3,
        description: "audit ledger and scheduler bookkeeping",
        sql: r#"
            CREATE TABLE audit_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type  TEXT NOT NULL,
                category    TEXT NOT NULL CHECK(category IN ('workflow-creation','staging','activation','credential-access','validation-failure','security','system')),
                workflow_id TEXT,
                actor       TEXT NOT NULL,
                details     TEXT NOT NULL DEFAULT '{}',
                source_addr TEXT,
                user_agent  TEXT,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_audit_events_category ON audit_events(category);
            CREATE INDEX idx_audit_events_workflow ON audit_events(workflow_id);
            CREATE INDEX idx_audit_events_created ON audit_events(created_at);

            CREATE TABLE scheduler_jobs (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL UNIQUE,
                interval_seconds INTEGER NOT NULL,
                enabled          BOOLEAN NOT NULL DEFAULT 1,
                created_at       INTEGER NOT NULL
            );

            CREATE TABLE scheduler_results (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id      TEXT NOT NULL REFERENCES scheduler_jobs(id),
                executed_at INTEGER NOT NULL,
                success     BOOLEAN NOT NULL,
                duration_ms INTEGER NOT NULL,
                error       TEXT
            );
            CREATE INDEX idx_scheduler_results_job ON scheduler_results(job_id);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// Synchronous — call from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // `conn.transaction()` needs `&mut Connection`, so manage it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// The expected latest migration version (update when adding migrations).
    const LATEST_VERSION: u32 = 3;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing"
            );
        }
    }

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        for table in [
            "documents",
            "chunk_embeddings",
            "pattern_entries",
            "store_meta",
            "workflows",
            "executions",
            "generation_jobs",
            "audit_events",
            "scheduler_jobs",
            "scheduler_results",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn document_source_check_constraint() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO documents (id, source, title, content, fingerprint, content_hash, last_ingested_at, created_at, updated_at) \
             VALUES ('d1', 'blog', 't', 'c', 'fp', 'ch', 0, 0, 0)",
            [],
        );
        assert!(bad.is_err());

        conn.execute(
            "INSERT INTO documents (id, source, title, content, fingerprint, content_hash, last_ingested_at, created_at, updated_at) \
             VALUES ('d1', 'doc-page', 't', 'c', 'fp', 'ch', 0, 0, 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn job_status_check_constraint() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO generation_jobs (id, status, request, submitted_at) \
             VALUES ('j1', 'paused', '{}', 0)",
            [],
        );
        assert!(bad.is_err());
    }
}
