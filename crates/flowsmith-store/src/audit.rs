//! Append-only audit ledger.
//!
//! Every security-relevant action gets one row here before the action is
//! considered complete. The ledger exposes no update or delete operations;
//! event ids are assigned by SQLite and strictly increase, so the recorded
//! order is the order of occurrence.
//!
//! Credential material never lands in `details` — callers record the
//! credential name and scope only.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// High-level category of an audit event, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditCategory {
    WorkflowCreation,
    Staging,
    Activation,
    CredentialAccess,
    ValidationFailure,
    Security,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowCreation => "workflow-creation",
            Self::Staging => "staging",
            Self::Activation => "activation",
            Self::CredentialAccess => "credential-access",
            Self::ValidationFailure => "validation-failure",
            Self::Security => "security",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workflow-creation" => Some(Self::WorkflowCreation),
            "staging" => Some(Self::Staging),
            "activation" => Some(Self::Activation),
            "credential-access" => Some(Self::CredentialAccess),
            "validation-failure" => Some(Self::ValidationFailure),
            "security" => Some(Self::Security),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: String,
    pub category: AuditCategory,
    pub workflow_id: Option<String>,
    pub actor: String,
    pub details: serde_json::Value,
    pub source_addr: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: i64,
}

/// Input for [`AuditLedger::append`].
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_type: String,
    pub category: AuditCategory,
    pub workflow_id: Option<String>,
    pub actor: String,
    pub details: serde_json::Value,
    pub source_addr: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAuditEvent {
    pub fn new(event_type: impl Into<String>, category: AuditCategory, actor: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            category,
            workflow_id: None,
            actor: actor.into(),
            details: serde_json::Value::Object(Default::default()),
            source_addr: None,
            user_agent: None,
        }
    }

    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

// ---------------------------------------------------------------------------
// AuditLedger
// ---------------------------------------------------------------------------

/// Append and query operations over the ledger. No mutation of past events.
#[derive(Clone)]
pub struct AuditLedger {
    db: Database,
}

impl AuditLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event and return its assigned id.
    ///
    /// The write completes before this returns; callers treat the audited
    /// action as done only after the append succeeds.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, category = %event.category))]
    pub async fn append(&self, event: NewAuditEvent) -> StoreResult<i64> {
        let details_json = serde_json::to_string(&event.details)?;
        let now = Utc::now().timestamp();

        let id = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO audit_events (event_type, category, workflow_id, actor, \
                     details, source_addr, user_agent, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        event.event_type,
                        event.category.as_str(),
                        event.workflow_id,
                        event.actor,
                        details_json,
                        event.source_addr,
                        event.user_agent,
                        now
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(event_id = id, "audit event appended");
        Ok(id)
    }

    /// Events in a category, oldest first.
    pub async fn by_category(&self, category: AuditCategory, limit: u32) -> StoreResult<Vec<AuditEvent>> {
        self.query(
            format!("{SELECT_EVENT} WHERE category = ?1 ORDER BY id ASC LIMIT ?2"),
            move |conn, sql| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![category.as_str(), limit], EventRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
        .await
    }

    /// Full trail for one workflow, oldest first.
    pub async fn by_workflow(&self, workflow_id: &str) -> StoreResult<Vec<AuditEvent>> {
        let workflow_id = workflow_id.to_string();
        self.query(
            format!("{SELECT_EVENT} WHERE workflow_id = ?1 ORDER BY id ASC"),
            move |conn, sql| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow_id], EventRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
        .await
    }

    /// Events in a closed time range `[from, to]` (unix seconds), oldest first.
    pub async fn in_range(&self, from: i64, to: i64) -> StoreResult<Vec<AuditEvent>> {
        self.query(
            format!("{SELECT_EVENT} WHERE created_at >= ?1 AND created_at <= ?2 ORDER BY id ASC"),
            move |conn, sql| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![from, to], EventRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
        .await
    }

    async fn query<F>(&self, sql: String, run: F) -> StoreResult<Vec<AuditEvent>>
    where
        F: FnOnce(&rusqlite::Connection, &str) -> StoreResult<Vec<EventRow>> + Send + 'static,
    {
        self.db
            .execute(move |conn| {
                let rows = run(conn, &sql)?;
                rows.into_iter().map(|r| r.into_event()).collect()
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Internal row mapping
// ---------------------------------------------------------------------------

const SELECT_EVENT: &str = "SELECT id, event_type, category, workflow_id, actor, details, \
     source_addr, user_agent, created_at FROM audit_events";

struct EventRow {
    id: i64,
    event_type: String,
    category: String,
    workflow_id: Option<String>,
    actor: String,
    details: String,
    source_addr: Option<String>,
    user_agent: Option<String>,
    created_at: i64,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            category: row.get(2)?,
            workflow_id: row.get(3)?,
            actor: row.get(4)?,
            details: row.get(5)?,
            source_addr: row.get(6)?,
            user_agent: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_event(self) -> StoreResult<AuditEvent> {
        Ok(AuditEvent {
            category: AuditCategory::parse(&self.category).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad audit category: {}", self.category))
            })?,
            details: serde_json::from_str(&self.details)?,
            id: self.id,
            event_type: self.event_type,
            workflow_id: self.workflow_id,
            actor: self.actor,
            source_addr: self.source_addr,
            user_agent: self.user_agent,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> AuditLedger {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        AuditLedger::new(db)
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let ledger = setup().await;
        let a = ledger
            .append(NewAuditEvent::new("workflow.created", AuditCategory::WorkflowCreation, "svc"))
            .await
            .unwrap();
        let b = ledger
            .append(NewAuditEvent::new("workflow.staged", AuditCategory::Staging, "svc"))
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn by_workflow_returns_trail_in_order() {
        let ledger = setup().await;
        for event_type in ["workflow.created", "workflow.validated", "workflow.staged"] {
            ledger
                .append(
                    NewAuditEvent::new(event_type, AuditCategory::WorkflowCreation, "svc")
                        .workflow("wf-1"),
                )
                .await
                .unwrap();
        }
        ledger
            .append(NewAuditEvent::new("other", AuditCategory::System, "svc").workflow("wf-2"))
            .await
            .unwrap();

        let trail = ledger.by_workflow("wf-1").await.unwrap();
        assert_eq!(trail.len(), 3);
        let types: Vec<&str> = trail.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["workflow.created", "workflow.validated", "workflow.staged"]);
    }

    #[tokio::test]
    async fn by_category_filters() {
        let ledger = setup().await;
        ledger
            .append(
                NewAuditEvent::new("credential.resolved", AuditCategory::CredentialAccess, "pipeline")
                    .details(json!({"credential_name": "slack-token", "scope": "slack"})),
            )
            .await
            .unwrap();
        ledger
            .append(NewAuditEvent::new("boot", AuditCategory::System, "main"))
            .await
            .unwrap();

        let events = ledger.by_category(AuditCategory::CredentialAccess, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details["credential_name"], "slack-token");
        // Only the name and scope are recorded, never the secret value.
        assert!(events[0].details.get("value").is_none());
    }

    #[tokio::test]
    async fn in_range_is_inclusive() {
        let ledger = setup().await;
        ledger
            .append(NewAuditEvent::new("boot", AuditCategory::System, "main"))
            .await
            .unwrap();

        let now = Utc::now().timestamp();
        let hits = ledger.in_range(now - 60, now + 60).await.unwrap();
        assert_eq!(hits.len(), 1);

        let misses = ledger.in_range(now + 3600, now + 7200).await.unwrap();
        assert!(misses.is_empty());
    }
}
