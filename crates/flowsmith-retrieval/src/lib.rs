//! # flowsmith-retrieval
//!
//! Semantic retrieval engine for Flowsmith.
//!
//! Documents ingested into the knowledge store are chunked deterministically,
//! embedded through a pluggable backend, and searched via an in-memory cosine
//! similarity index hydrated from SQLite. Embedding is decoupled from
//! ingestion: a backend outage leaves documents pending and search degraded,
//! never blocked.
//!
//! ## Quick start
//!
//! ```ignore
//! use flowsmith_retrieval::{RetrievalConfig, RetrievalEngine};
//!
//! let engine = RetrievalEngine::new(knowledge, backend, RetrievalConfig::default());
//! engine.hydrate().await?;
//! let hits = engine.search("notify slack on new order", 5).await?;
//! ```

pub mod chunker;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod index;

// ── re-exports ───────────────────────────────────────────────────────

pub use chunker::{Chunker, ChunkerConfig};
pub use embedder::{EmbeddingBackend, EmbeddingClientConfig, HttpEmbeddingBackend};
pub use engine::{RetrievalConfig, RetrievalEngine};
pub use error::{Result, RetrievalError};
pub use index::{DocumentRef, SearchHit, SimilarityIndex};
