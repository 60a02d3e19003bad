//! Pattern library — reusable best practices and anti-patterns.
//!
//! Entries are extracted from ingested documents and reinforced by the
//! generation pipeline: every reuse bumps `usage_count` and nudges the
//! confidence score toward 1.0.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Category of a pattern library entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternCategory {
    ErrorHandling,
    RetryLogic,
    Transformation,
    Integration,
    Security,
    Performance,
    General,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorHandling => "error-handling",
            Self::RetryLogic => "retry-logic",
            Self::Transformation => "transformation",
            Self::Integration => "integration",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error-handling" => Some(Self::ErrorHandling),
            "retry-logic" => Some(Self::RetryLogic),
            "transformation" => Some(Self::Transformation),
            "integration" => Some(Self::Integration),
            "security" => Some(Self::Security),
            "performance" => Some(Self::Performance),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable practice (or anti-pattern) in the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEntry {
    pub id: String,
    pub name: String,
    pub category: PatternCategory,
    pub description: String,
    pub example_config: Option<serde_json::Value>,
    pub source_document_ids: Vec<String>,
    pub usage_count: u32,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// True when this entry describes what NOT to do.
    pub anti_pattern: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`PatternStore::upsert`].
#[derive(Debug, Clone)]
pub struct NewPattern {
    pub name: String,
    pub category: PatternCategory,
    pub description: String,
    pub example_config: Option<serde_json::Value>,
    pub source_document_ids: Vec<String>,
    pub confidence: f64,
    pub anti_pattern: bool,
}

// ---------------------------------------------------------------------------
// PatternStore
// ---------------------------------------------------------------------------

/// CRUD plus reinforcement for pattern library entries.
#[derive(Clone)]
pub struct PatternStore {
    db: Database,
}

impl PatternStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a pattern or update an existing one by name.
    ///
    /// Upserting keeps usage counts from earlier reinforcement.
    #[instrument(skip(self, pattern), fields(name = %pattern.name))]
    pub async fn upsert(&self, pattern: NewPattern) -> StoreResult<PatternEntry> {
        if !(0.0..=1.0).contains(&pattern.confidence) {
            return Err(StoreError::InvalidArgument(format!(
                "confidence must be in [0,1], got {}",
                pattern.confidence
            )));
        }

        let id = Uuid::now_v7().to_string();
        let now = Utc::now().timestamp();
        let example_json = pattern
            .example_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let sources_json = serde_json::to_string(&pattern.source_document_ids)?;
        let name = pattern.name.clone();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO pattern_entries (id, name, category, description, example_config, \
                     source_document_ids, usage_count, confidence, anti_pattern, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?9) \
                     ON CONFLICT(name) DO UPDATE SET \
                        category = excluded.category, \
                        description = excluded.description, \
                        example_config = excluded.example_config, \
                        source_document_ids = excluded.source_document_ids, \
                        confidence = excluded.confidence, \
                        anti_pattern = excluded.anti_pattern, \
                        updated_at = excluded.updated_at",
                    rusqlite::params![
                        id,
                        pattern.name,
                        pattern.category.as_str(),
                        pattern.description,
                        example_json,
                        sources_json,
                        pattern.confidence,
                        pattern.anti_pattern,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;

        self.get_by_name(&name)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "pattern",
                id: name,
            })
    }

    /// Fetch a pattern by name.
    pub async fn get_by_name(&self, name: &str) -> StoreResult<Option<PatternEntry>> {
        let name = name.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_PATTERN} WHERE name = ?1"),
                    rusqlite::params![name],
                    PatternRow::from_row,
                );
                match result {
                    Ok(row) => row.into_entry().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All patterns in a category, most confident first.
    pub async fn list_by_category(
        &self,
        category: PatternCategory,
    ) -> StoreResult<Vec<PatternEntry>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_PATTERN} WHERE category = ?1 ORDER BY confidence DESC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![category.as_str()], PatternRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_entry()).collect()
            })
            .await
    }

    /// Every entry, most confident first.
    pub async fn list_all(&self) -> StoreResult<Vec<PatternEntry>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_PATTERN} ORDER BY confidence DESC"))?;
                let rows = stmt
                    .query_map([], PatternRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_entry()).collect()
            })
            .await
    }

    /// Record one reuse of a pattern: bump usage and reinforce confidence.
    ///
    /// Confidence moves a tenth of the way toward 1.0 per reuse, capped there.
    #[instrument(skip(self))]
    pub async fn record_usage(&self, name: &str) -> StoreResult<()> {
        let name = name.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE pattern_entries SET usage_count = usage_count + 1, \
                     confidence = MIN(confidence + (1.0 - confidence) * 0.1, 1.0), \
                     updated_at = ?2 WHERE name = ?1",
                    rusqlite::params![name, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "pattern",
                        id: name,
                    });
                }
                Ok(())
            })
            .await?;
        debug!("pattern usage recorded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row mapping
// ---------------------------------------------------------------------------

const SELECT_PATTERN: &str = "SELECT id, name, category, description, example_config, \
     source_document_ids, usage_count, confidence, anti_pattern, created_at, updated_at \
     FROM pattern_entries";

struct PatternRow {
    id: String,
    name: String,
    category: String,
    description: String,
    example_config: Option<String>,
    source_document_ids: String,
    usage_count: u32,
    confidence: f64,
    anti_pattern: bool,
    created_at: i64,
    updated_at: i64,
}

impl PatternRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            description: row.get(3)?,
            example_config: row.get(4)?,
            source_document_ids: row.get(5)?,
            usage_count: row.get(6)?,
            confidence: row.get(7)?,
            anti_pattern: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> StoreResult<PatternEntry> {
        Ok(PatternEntry {
            category: PatternCategory::parse(&self.category).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad pattern category: {}", self.category))
            })?,
            example_config: self
                .example_config
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            source_document_ids: serde_json::from_str(&self.source_document_ids)?,
            id: self.id,
            name: self.name,
            description: self.description,
            usage_count: self.usage_count,
            confidence: self.confidence,
            anti_pattern: self.anti_pattern,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
