//! Knowledge store — ingested documents and their chunk embeddings.
//!
//! Documents are deduplicated by a content fingerprint: a SHA-256 digest of
//! the normalized content (lowercased, whitespace-collapsed). Re-ingesting
//! identical content refreshes freshness and `last_ingested_at` instead of
//! inserting a duplicate row. Documents are never hard-deleted; a replaced
//! document is marked superseded and its chunks removed.
//!
//! Chunk vectors are stored as little-endian f32 blobs. The store's embedding
//! dimension is fixed by the first vector written and enforced afterwards.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where an ingested document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentSource {
    Template,
    DocPage,
    Transcript,
    Pattern,
    Manual,
    Custom,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::DocPage => "doc-page",
            Self::Transcript => "transcript",
            Self::Pattern => "pattern",
            Self::Manual => "manual",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "template" => Some(Self::Template),
            "doc-page" => Some(Self::DocPage),
            "transcript" => Some(Self::Transcript),
            "pattern" => Some(Self::Pattern),
            "manual" => Some(Self::Manual),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedState {
    /// Ingested but not yet chunked/embedded.
    Pending,
    /// All chunks embedded and stored.
    Embedded,
    /// Last embedding attempt failed; eligible for retry.
    Failed,
}

impl EmbedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Embedded => "embedded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "embedded" => Some(Self::Embedded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted unit of ingested knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: DocumentSource,
    pub url: Option<String>,
    pub title: String,
    pub content: String,
    pub metadata: serde_json::Value,
    /// SHA-256 of the normalized content; globally unique.
    pub fingerprint: String,
    /// SHA-256 of the raw content, used to detect content drift on re-ingest.
    pub content_hash: String,
    pub freshness_score: f64,
    pub embed_state: EmbedState,
    pub embed_attempts: u32,
    pub superseded_by: Option<String>,
    pub last_ingested_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`KnowledgeStore::ingest`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source: DocumentSource,
    pub url: Option<String>,
    pub title: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Outcome of an ingest call.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// First sighting of this content.
    Inserted(Document),
    /// Fingerprint already known; freshness and timestamp refreshed.
    Refreshed(Document),
}

impl IngestOutcome {
    pub fn document(&self) -> &Document {
        match self {
            Self::Inserted(doc) | Self::Refreshed(doc) => doc,
        }
    }
}

/// A stored chunk with its embedding vector.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub document_id: String,
    pub chunk_index: u32,
    pub chunk_text: String,
    pub vector: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Fingerprinting
// ---------------------------------------------------------------------------

/// Collapse whitespace runs and lowercase, so trivially reformatted copies of
/// the same content share a fingerprint.
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Content fingerprint: SHA-256 of the normalized content.
pub fn fingerprint(content: &str) -> String {
    sha256_hex(normalize_content(content).as_bytes())
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

/// Document and chunk-embedding persistence.
#[derive(Clone)]
pub struct KnowledgeStore {
    db: Database,
}

impl KnowledgeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Ingest a document, deduplicating by content fingerprint.
    ///
    /// A fingerprint hit refreshes `freshness_score` and `last_ingested_at`.
    /// If the raw content hash changed (normalization hid a real edit), the
    /// document's embed state is reset to `pending` so it gets re-embedded.
    #[instrument(skip(self, doc), fields(title = %doc.title))]
    pub async fn ingest(&self, doc: NewDocument) -> StoreResult<IngestOutcome> {
        let fp = fingerprint(&doc.content);
        let content_hash = sha256_hex(doc.content.as_bytes());
        let now = Utc::now().timestamp();
        let metadata_json = serde_json::to_string(&doc.metadata)?;

        let fp_for_query = fp.clone();
        let existing = self
            .db
            .execute(move |conn| Self::get_by_fingerprint_sync(conn, &fp_for_query))
            .await?;

        if let Some(existing) = existing {
            let id = existing.id.clone();
            let content_changed = existing.content_hash != content_hash;
            let id2 = id.clone();
            let hash2 = content_hash.clone();
            let content2 = doc.content.clone();
            self.db
                .execute(move |conn| {
                    if content_changed {
                        conn.execute(
                            "UPDATE documents SET freshness_score = 1.0, last_ingested_at = ?2, \
                             content = ?4, content_hash = ?3, embed_state = 'pending', \
                             embed_attempts = 0, updated_at = ?2 WHERE id = ?1",
                            rusqlite::params![id2, now, hash2, content2],
                        )?;
                    } else {
                        conn.execute(
                            "UPDATE documents SET freshness_score = 1.0, last_ingested_at = ?2, \
                             updated_at = ?2 WHERE id = ?1",
                            rusqlite::params![id2, now],
                        )?;
                    }
                    Ok(())
                })
                .await?;

            debug!(document_id = %id, content_changed, "fingerprint hit, document refreshed");
            let refreshed = self
                .get(&id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "document",
                    id,
                })?;
            return Ok(IngestOutcome::Refreshed(refreshed));
        }

        let id = Uuid::now_v7().to_string();
        let document = Document {
            id: id.clone(),
            source: doc.source,
            url: doc.url.clone(),
            title: doc.title.clone(),
            content: doc.content.clone(),
            metadata: doc.metadata,
            fingerprint: fp.clone(),
            content_hash: content_hash.clone(),
            freshness_score: 1.0,
            embed_state: EmbedState::Pending,
            embed_attempts: 0,
            superseded_by: None,
            last_ingested_at: now,
            created_at: now,
            updated_at: now,
        };

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO documents (id, source, url, title, content, metadata, fingerprint, \
                     content_hash, freshness_score, embed_state, embed_attempts, last_ingested_at, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1.0, 'pending', 0, ?9, ?9, ?9)",
                    rusqlite::params![
                        id,
                        doc.source.as_str(),
                        doc.url,
                        doc.title,
                        doc.content,
                        metadata_json,
                        fp,
                        content_hash,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;

        info!(document_id = %document.id, source = %document.source, "document ingested");
        Ok(IngestOutcome::Inserted(document))
    }

    /// Fetch a document by id.
    pub async fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_DOCUMENT} WHERE id = ?1"),
                    rusqlite::params![id],
                    DocumentRow::from_row,
                );
                match result {
                    Ok(row) => row.into_document().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Fetch a document by content fingerprint.
    pub async fn get_by_fingerprint(&self, fp: &str) -> StoreResult<Option<Document>> {
        let fp = fp.to_string();
        self.db
            .execute(move |conn| Self::get_by_fingerprint_sync(conn, &fp))
            .await
    }

    fn get_by_fingerprint_sync(
        conn: &rusqlite::Connection,
        fp: &str,
    ) -> StoreResult<Option<Document>> {
        let result = conn.query_row(
            &format!("{SELECT_DOCUMENT} WHERE fingerprint = ?1"),
            rusqlite::params![fp],
            DocumentRow::from_row,
        );
        match result {
            Ok(row) => row.into_document().map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Documents awaiting embedding (pending or previously failed), oldest
    /// first, excluding superseded rows.
    pub async fn pending_embedding(&self, limit: i64) -> StoreResult<Vec<Document>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_DOCUMENT} WHERE embed_state IN ('pending','failed') \
                     AND superseded_by IS NULL ORDER BY last_ingested_at ASC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], DocumentRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_document()).collect()
            })
            .await
    }

    /// Mark a document fully embedded.
    pub async fn mark_embedded(&self, id: &str) -> StoreResult<()> {
        self.set_embed_state(id, EmbedState::Embedded, false).await
    }

    /// Record a failed embedding attempt; the document stays eligible for
    /// retry and never blocks ingestion or search.
    pub async fn mark_embed_failed(&self, id: &str) -> StoreResult<()> {
        self.set_embed_state(id, EmbedState::Failed, true).await
    }

    async fn set_embed_state(
        &self,
        id: &str,
        state: EmbedState,
        bump_attempts: bool,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    if bump_attempts {
                        "UPDATE documents SET embed_state = ?2, embed_attempts = embed_attempts + 1, updated_at = ?3 WHERE id = ?1"
                    } else {
                        "UPDATE documents SET embed_state = ?2, updated_at = ?3 WHERE id = ?1"
                    },
                    rusqlite::params![id, state.as_str(), now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "document",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Mark `old_id` as superseded by `new_id` and drop its chunks.
    ///
    /// The superseded row stays in place for provenance; only its vectors
    /// leave the searchable set.
    #[instrument(skip(self))]
    pub async fn supersede(&self, old_id: &str, new_id: &str) -> StoreResult<()> {
        let old = old_id.to_string();
        let new = new_id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE documents SET superseded_by = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![old, new, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "document",
                        id: old,
                    });
                }
                tx.execute(
                    "DELETE FROM chunk_embeddings WHERE document_id = ?1",
                    rusqlite::params![old],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Multiplicatively decay every live document's freshness score.
    ///
    /// Returns the number of documents touched. Scores never drop below
    /// `floor`.
    pub async fn decay_freshness(&self, factor: f64, floor: f64) -> StoreResult<usize> {
        let now = Utc::now().timestamp();
        let touched = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "UPDATE documents SET freshness_score = MAX(freshness_score * ?1, ?2), \
                     updated_at = ?3 WHERE superseded_by IS NULL",
                    rusqlite::params![factor, floor, now],
                )?;
                Ok(n)
            })
            .await?;
        debug!(touched, factor, "freshness decay applied");
        Ok(touched)
    }

    // ── chunk embeddings ─────────────────────────────────────────────

    /// Upsert the chunk embeddings for a document.
    ///
    /// Idempotent on `(document_id, chunk_index)`: re-embedding after no
    /// content change updates rows in place. The first vector ever written
    /// fixes the store dimension; later writes must match it.
    #[instrument(skip(self, chunks))]
    pub async fn put_chunks(&self, document_id: &str, chunks: Vec<StoredChunk>) -> StoreResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let document_id = document_id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let dim = chunks[0].vector.len();
                for chunk in &chunks {
                    if chunk.vector.len() != dim {
                        return Err(StoreError::DimensionMismatch {
                            expected: dim,
                            got: chunk.vector.len(),
                        });
                    }
                }

                let tx = conn.transaction()?;

                // Dimension is fixed store-wide at first write.
                let stored_dim: Option<usize> = tx
                    .query_row(
                        "SELECT value FROM store_meta WHERE key = 'embedding_dimension'",
                        [],
                        |row| row.get::<_, String>(0),
                    )
                    .map(|v| v.parse().ok())
                    .unwrap_or(None);
                match stored_dim {
                    Some(expected) if expected != dim => {
                        return Err(StoreError::DimensionMismatch { expected, got: dim });
                    }
                    Some(_) => {}
                    None => {
                        tx.execute(
                            "INSERT INTO store_meta (key, value) VALUES ('embedding_dimension', ?1)",
                            rusqlite::params![dim.to_string()],
                        )?;
                    }
                }

                for chunk in &chunks {
                    tx.execute(
                        "INSERT INTO chunk_embeddings (document_id, chunk_index, chunk_text, vector, dimension, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                         ON CONFLICT(document_id, chunk_index) DO UPDATE SET \
                            chunk_text = excluded.chunk_text, \
                            vector = excluded.vector, \
                            dimension = excluded.dimension",
                        rusqlite::params![
                            document_id,
                            chunk.chunk_index,
                            chunk.chunk_text,
                            vector_to_blob(&chunk.vector),
                            dim as i64,
                            now,
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// The fixed embedding dimension, if any vector has been stored yet.
    pub async fn embedding_dimension(&self) -> StoreResult<Option<usize>> {
        self.db
            .execute(|conn| {
                let dim: Option<String> = conn
                    .query_row(
                        "SELECT value FROM store_meta WHERE key = 'embedding_dimension'",
                        [],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(dim.and_then(|v| v.parse().ok()))
            })
            .await
    }

    /// Load every live chunk (for index hydration).
    pub async fn all_chunks(&self) -> StoreResult<Vec<StoredChunk>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT ce.document_id, ce.chunk_index, ce.chunk_text, ce.vector \
                     FROM chunk_embeddings ce \
                     JOIN documents d ON d.id = ce.document_id \
                     WHERE d.superseded_by IS NULL",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows
                    .into_iter()
                    .map(|(document_id, chunk_index, chunk_text, blob)| StoredChunk {
                        document_id,
                        chunk_index,
                        chunk_text,
                        vector: blob_to_vector(&blob),
                    })
                    .collect())
            })
            .await
    }

    /// Chunks for one document, ordered by chunk index.
    pub async fn chunks_for(&self, document_id: &str) -> StoreResult<Vec<StoredChunk>> {
        let document_id = document_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT document_id, chunk_index, chunk_text, vector FROM chunk_embeddings \
                     WHERE document_id = ?1 ORDER BY chunk_index",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![document_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows
                    .into_iter()
                    .map(|(document_id, chunk_index, chunk_text, blob)| StoredChunk {
                        document_id,
                        chunk_index,
                        chunk_text,
                        vector: blob_to_vector(&blob),
                    })
                    .collect())
            })
            .await
    }

    /// Total number of live (non-superseded) documents.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let c: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM documents WHERE superseded_by IS NULL",
                    [],
                    |row| row.get(0),
                )?;
                Ok(c)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Internal row mapping
// ---------------------------------------------------------------------------

const SELECT_DOCUMENT: &str = "SELECT id, source, url, title, content, metadata, fingerprint, \
     content_hash, freshness_score, embed_state, embed_attempts, superseded_by, \
     last_ingested_at, created_at, updated_at FROM documents";

/// Raw row before JSON/enum parsing, keeping the rusqlite closure infallible
/// beyond column access.
struct DocumentRow {
    id: String,
    source: String,
    url: Option<String>,
    title: String,
    content: String,
    metadata: String,
    fingerprint: String,
    content_hash: String,
    freshness_score: f64,
    embed_state: String,
    embed_attempts: u32,
    superseded_by: Option<String>,
    last_ingested_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl DocumentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            url: row.get(2)?,
            title: row.get(3)?,
            content: row.get(4)?,
            metadata: row.get(5)?,
            fingerprint: row.get(6)?,
            content_hash: row.get(7)?,
            freshness_score: row.get(8)?,
            embed_state: row.get(9)?,
            embed_attempts: row.get(10)?,
            superseded_by: row.get(11)?,
            last_ingested_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_document(self) -> StoreResult<Document> {
        let metadata: serde_json::Value = serde_json::from_str(&self.metadata)?;
        Ok(Document {
            source: DocumentSource::parse(&self.source).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad document source: {}", self.source))
            })?,
            embed_state: EmbedState::parse(&self.embed_state).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad embed state: {}", self.embed_state))
            })?,
            id: self.id,
            url: self.url,
            title: self.title,
            content: self.content,
            metadata,
            fingerprint: self.fingerprint,
            content_hash: self.content_hash,
            freshness_score: self.freshness_score,
            embed_attempts: self.embed_attempts,
            superseded_by: self.superseded_by,
            last_ingested_at: self.last_ingested_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> KnowledgeStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        KnowledgeStore::new(db)
    }

    fn doc(title: &str, content: &str, url: Option<&str>) -> NewDocument {
        NewDocument {
            source: DocumentSource::DocPage,
            url: url.map(|u| u.to_string()),
            title: title.to_string(),
            content: content.to_string(),
            metadata: json!({}),
        }
    }

    #[test]
    fn fingerprint_ignores_whitespace_and_case() {
        assert_eq!(
            fingerprint("Hello   World"),
            fingerprint("hello\nworld")
        );
        assert_ne!(fingerprint("hello world"), fingerprint("hello mars"));
    }

    #[tokio::test]
    async fn ingest_and_get() {
        let store = setup().await;
        let outcome = store
            .ingest(doc("Webhook guide", "How to receive webhooks", None))
            .await
            .unwrap();

        let IngestOutcome::Inserted(inserted) = outcome else {
            panic!("expected insert");
        };
        assert_eq!(inserted.embed_state, EmbedState::Pending);
        assert_eq!(inserted.freshness_score, 1.0);

        let fetched = store.get(&inserted.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Webhook guide");
    }

    #[tokio::test]
    async fn duplicate_content_refreshes_instead_of_duplicating() {
        let store = setup().await;
        let first = store
            .ingest(doc("A", "same content here", Some("https://a.example")))
            .await
            .unwrap();

        // Different URL and title, identical content.
        let second = store
            .ingest(doc("B", "same  CONTENT here", Some("https://b.example")))
            .await
            .unwrap();

        let IngestOutcome::Refreshed(refreshed) = second else {
            panic!("expected refresh");
        };
        assert_eq!(refreshed.id, first.document().id);
        assert!(refreshed.last_ingested_at >= first.document().last_ingested_at);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn content_change_resets_embed_state() {
        let store = setup().await;
        let first = store.ingest(doc("A", "original words", None)).await.unwrap();
        let id = first.document().id.clone();
        store.mark_embedded(&id).await.unwrap();

        // Same fingerprint only if normalized content matches; a raw-hash
        // change with equal fingerprint needs a whitespace-only edit.
        let second = store.ingest(doc("A", "Original   WORDS", None)).await.unwrap();
        let refreshed = second.document();
        assert_eq!(refreshed.id, id);
        assert_eq!(refreshed.embed_state, EmbedState::Pending);
    }

    #[tokio::test]
    async fn put_chunks_is_idempotent() {
        let store = setup().await;
        let inserted = store.ingest(doc("A", "chunky content", None)).await.unwrap();
        let id = inserted.document().id.clone();

        let chunks = vec![
            StoredChunk {
                document_id: id.clone(),
                chunk_index: 0,
                chunk_text: "chunky".into(),
                vector: vec![1.0, 0.0, 0.0],
            },
            StoredChunk {
                document_id: id.clone(),
                chunk_index: 1,
                chunk_text: "content".into(),
                vector: vec![0.0, 1.0, 0.0],
            },
        ];

        store.put_chunks(&id, chunks.clone()).await.unwrap();
        store.put_chunks(&id, chunks).await.unwrap();

        let stored = store.chunks_for(&id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].vector, vec![1.0, 0.0, 0.0]);
        assert_eq!(store.embedding_dimension().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn dimension_is_fixed_at_first_write() {
        let store = setup().await;
        let inserted = store.ingest(doc("A", "abc", None)).await.unwrap();
        let id = inserted.document().id.clone();

        store
            .put_chunks(
                &id,
                vec![StoredChunk {
                    document_id: id.clone(),
                    chunk_index: 0,
                    chunk_text: "abc".into(),
                    vector: vec![0.5, 0.5],
                }],
            )
            .await
            .unwrap();

        let result = store
            .put_chunks(
                &id,
                vec![StoredChunk {
                    document_id: id.clone(),
                    chunk_index: 1,
                    chunk_text: "def".into(),
                    vector: vec![0.1, 0.2, 0.3],
                }],
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn supersede_removes_chunks_but_keeps_row() {
        let store = setup().await;
        let old = store.ingest(doc("Old", "old content", None)).await.unwrap();
        let new = store.ingest(doc("New", "new content", None)).await.unwrap();
        let old_id = old.document().id.clone();
        let new_id = new.document().id.clone();

        store
            .put_chunks(
                &old_id,
                vec![StoredChunk {
                    document_id: old_id.clone(),
                    chunk_index: 0,
                    chunk_text: "old".into(),
                    vector: vec![1.0],
                }],
            )
            .await
            .unwrap();

        store.supersede(&old_id, &new_id).await.unwrap();

        let row = store.get(&old_id).await.unwrap().unwrap();
        assert_eq!(row.superseded_by.as_deref(), Some(new_id.as_str()));
        assert!(store.chunks_for(&old_id).await.unwrap().is_empty());
        assert!(store.all_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_embedding_and_state_transitions() {
        let store = setup().await;
        let a = store.ingest(doc("A", "aaa", None)).await.unwrap();
        let b = store.ingest(doc("B", "bbb", None)).await.unwrap();

        let pending = store.pending_embedding(10).await.unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_embedded(&a.document().id).await.unwrap();
        store.mark_embed_failed(&b.document().id).await.unwrap();

        // Failed documents stay eligible for retry.
        let pending = store.pending_embedding(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.document().id);
        assert_eq!(pending[0].embed_attempts, 1);
    }

    #[tokio::test]
    async fn freshness_decay_respects_floor() {
        let store = setup().await;
        store.ingest(doc("A", "aaa", None)).await.unwrap();

        for _ in 0..50 {
            store.decay_freshness(0.5, 0.1).await.unwrap();
        }

        let all = store.pending_embedding(10).await.unwrap();
        assert!((all[0].freshness_score - 0.1).abs() < 1e-9);
    }
}
