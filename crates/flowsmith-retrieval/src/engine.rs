//! The retrieval engine.
//!
//! Ties together the knowledge store, the chunker, the embedding backend and
//! the in-memory similarity index. Ingestion persists the document and
//! returns immediately; chunking and embedding happen later (worker sweep or
//! scheduler), so a slow or failing embedding backend never blocks ingestion
//! or search — search simply finds fewer candidates until embedding catches
//! up.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, info, instrument, warn};

use flowsmith_store::{IngestOutcome, KnowledgeStore, NewDocument, StoredChunk};

use crate::chunker::{Chunker, ChunkerConfig};
use crate::embedder::EmbeddingBackend;
use crate::error::{Result, RetrievalError};
use crate::index::{DocumentRef, SearchHit, SimilarityIndex};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub chunker: ChunkerConfig,
    /// Bounded retry for embedding calls: attempts, base delay, cap.
    pub embed_attempts: u32,
    pub embed_backoff_base: Duration,
    pub embed_backoff_cap: Duration,
    /// Query-embedding cache size and TTL.
    pub query_cache_capacity: u64,
    pub query_cache_ttl: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            embed_attempts: 3,
            embed_backoff_base: Duration::from_secs(1),
            embed_backoff_cap: Duration::from_secs(30),
            query_cache_capacity: 512,
            query_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Semantic retrieval over the knowledge store.
pub struct RetrievalEngine {
    knowledge: KnowledgeStore,
    backend: Arc<dyn EmbeddingBackend>,
    chunker: Chunker,
    index: SimilarityIndex,
    query_cache: Cache<String, Arc<Vec<f32>>>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        knowledge: KnowledgeStore,
        backend: Arc<dyn EmbeddingBackend>,
        config: RetrievalConfig,
    ) -> Self {
        let query_cache = Cache::builder()
            .max_capacity(config.query_cache_capacity)
            .time_to_live(config.query_cache_ttl)
            .build();
        Self {
            knowledge,
            backend,
            chunker: Chunker::new(config.chunker.clone()),
            index: SimilarityIndex::new(),
            query_cache,
            config,
        }
    }

    /// Access to the underlying knowledge store.
    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    // ── ingestion ────────────────────────────────────────────────────

    /// Persist a document, deduplicating by fingerprint. Embedding is
    /// deferred; call [`embed_pending`](Self::embed_pending) to catch up.
    pub async fn ingest(&self, doc: NewDocument) -> Result<IngestOutcome> {
        Ok(self.knowledge.ingest(doc).await?)
    }

    /// Chunk and embed up to `limit` documents awaiting embedding.
    ///
    /// A document whose embedding fails is marked failed (eligible for a
    /// later retry) and does not stop the sweep. Returns the number of
    /// documents embedded.
    #[instrument(skip(self))]
    pub async fn embed_pending(&self, limit: i64) -> Result<usize> {
        let pending = self.knowledge.pending_embedding(limit).await?;
        let mut embedded = 0;

        for doc in pending {
            match self.embed_document(&doc.id).await {
                Ok(chunks) => {
                    debug!(document_id = %doc.id, chunks, "document embedded");
                    embedded += 1;
                }
                Err(err) => {
                    warn!(document_id = %doc.id, %err, "embedding failed, will retry later");
                    self.knowledge.mark_embed_failed(&doc.id).await?;
                }
            }
        }

        if embedded > 0 {
            info!(embedded, "embedding sweep complete");
        }
        Ok(embedded)
    }

    /// Chunk and embed a single document, store its vectors, and make it
    /// searchable. Returns the chunk count.
    pub async fn embed_document(&self, document_id: &str) -> Result<usize> {
        let doc = self
            .knowledge
            .get(document_id)
            .await?
            .ok_or_else(|| RetrievalError::Store(flowsmith_store::StoreError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            }))?;

        let texts = self.chunker.chunk(&doc.content);
        let mut chunks = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let vector = self.embed_with_retry(text).await?;
            chunks.push(StoredChunk {
                document_id: doc.id.clone(),
                chunk_index: i as u32,
                chunk_text: text.clone(),
                vector,
            });
        }

        self.knowledge.put_chunks(&doc.id, chunks.clone()).await?;
        self.knowledge.mark_embedded(&doc.id).await?;

        self.index.upsert_document(
            DocumentRef {
                document_id: doc.id.clone(),
                title: doc.title.clone(),
                url: doc.url.clone(),
                source: doc.source.as_str().to_string(),
            },
            chunks
                .into_iter()
                .map(|c| (c.chunk_index, c.chunk_text, c.vector)),
        );

        Ok(texts.len())
    }

    /// Replace `old_id` with `new_id`: supersede in the store and drop the
    /// old document from the searchable set.
    pub async fn supersede(&self, old_id: &str, new_id: &str) -> Result<()> {
        self.knowledge.supersede(old_id, new_id).await?;
        self.index.remove_document(old_id);
        Ok(())
    }

    /// Rebuild the in-memory index from the store (startup).
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> Result<usize> {
        let chunks = self.knowledge.all_chunks().await?;

        let mut by_document: std::collections::HashMap<String, Vec<StoredChunk>> =
            std::collections::HashMap::new();
        for chunk in chunks {
            by_document.entry(chunk.document_id.clone()).or_default().push(chunk);
        }

        let mut total = 0;
        for (document_id, chunks) in by_document {
            let Some(doc) = self.knowledge.get(&document_id).await? else {
                continue;
            };
            total += chunks.len();
            self.index.upsert_document(
                DocumentRef {
                    document_id: doc.id,
                    title: doc.title,
                    url: doc.url,
                    source: doc.source.as_str().to_string(),
                },
                chunks
                    .into_iter()
                    .map(|c| (c.chunk_index, c.chunk_text, c.vector)),
            );
        }

        info!(chunks = total, documents = self.index.document_count(), "index hydrated");
        Ok(total)
    }

    // ── search ───────────────────────────────────────────────────────

    /// Embed `query` and return the `top_k` most similar chunks, each with
    /// its source document's id/url/title for attribution.
    #[instrument(skip(self), fields(top_k))]
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        self.search_filtered(query, top_k, None).await
    }

    /// [`search`](Self::search) restricted to one document source.
    pub async fn search_filtered(
        &self,
        query: &str,
        top_k: usize,
        source: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(RetrievalError::InvalidQuery("empty query".into()));
        }

        let vector = self.query_embedding(query).await?;
        let hits = match source {
            None => self.index.search(&vector, top_k),
            Some(source) => {
                // Over-fetch, then keep the best matches from the source.
                let mut hits = self.index.search(&vector, top_k.saturating_mul(4));
                hits.retain(|h| h.document.source == source);
                hits.truncate(top_k);
                hits
            }
        };
        debug!(hits = hits.len(), "search complete");
        Ok(hits)
    }

    /// Query embeddings are cached: identical query strings within the TTL
    /// reuse the vector instead of re-calling the backend.
    async fn query_embedding(&self, query: &str) -> Result<Arc<Vec<f32>>> {
        let backend = Arc::clone(&self.backend);
        let attempts = self.config.embed_attempts;
        let base = self.config.embed_backoff_base;
        let cap = self.config.embed_backoff_cap;
        let text = query.to_string();

        self.query_cache
            .try_get_with(query.to_string(), async move {
                embed_with_retry_inner(backend.as_ref(), &text, attempts, base, cap)
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|e: Arc<RetrievalError>| RetrievalError::Backend {
                reason: e.to_string(),
                retryable: e.is_retryable(),
            })
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        embed_with_retry_inner(
            self.backend.as_ref(),
            text,
            self.config.embed_attempts,
            self.config.embed_backoff_base,
            self.config.embed_backoff_cap,
        )
        .await
    }
}

/// Bounded retry with exponential backoff; permanent errors fail fast.
async fn embed_with_retry_inner(
    backend: &dyn EmbeddingBackend,
    text: &str,
    attempts: u32,
    base: Duration,
    cap: Duration,
) -> Result<Vec<f32>> {
    let mut delay = base;
    let mut attempt = 1;
    loop {
        match backend.embed(text).await {
            Ok(vector) => return Ok(vector),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, %err, "embedding call failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
