//! In-memory similarity index over chunk embeddings.
//!
//! Vectors are L2-normalized on insert, so cosine similarity reduces to a
//! dot product at query time. The index is a `DashMap` keyed by document id
//! and is hydrated from the knowledge store at startup; search is a brute
//! force scan, which is the right trade-off at the corpus sizes this store
//! sees (thousands of chunks, not millions).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Document attribution carried on every hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: String,
    pub title: String,
    pub url: Option<String>,
    pub source: String,
}

/// One search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub score: f32,
    pub chunk_index: u32,
    pub chunk_text: String,
    #[serde(flatten)]
    pub document: DocumentRef,
}

struct IndexedChunk {
    chunk_index: u32,
    chunk_text: String,
    /// Unit-length vector.
    vector: Vec<f32>,
}

struct IndexedDocument {
    reference: DocumentRef,
    chunks: Vec<IndexedChunk>,
}

/// Shared, concurrently updatable similarity index.
pub struct SimilarityIndex {
    documents: DashMap<String, IndexedDocument>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    /// Insert (or replace) all chunks of a document.
    pub fn upsert_document(
        &self,
        reference: DocumentRef,
        chunks: impl IntoIterator<Item = (u32, String, Vec<f32>)>,
    ) {
        let chunks = chunks
            .into_iter()
            .map(|(chunk_index, chunk_text, vector)| IndexedChunk {
                chunk_index,
                chunk_text,
                vector: normalize(vector),
            })
            .collect();
        self.documents.insert(
            reference.document_id.clone(),
            IndexedDocument { reference, chunks },
        );
    }

    /// Drop a document's chunks (superseded documents leave the index).
    pub fn remove_document(&self, document_id: &str) {
        self.documents.remove(document_id);
    }

    /// Top-`k` chunks by cosine similarity to `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let query = normalize(query.to_vec());

        let mut hits: Vec<SearchHit> = Vec::new();
        for entry in self.documents.iter() {
            for chunk in &entry.chunks {
                if chunk.vector.len() != query.len() {
                    continue;
                }
                let score = dot(&query, &chunk.vector);
                hits.push(SearchHit {
                    score,
                    chunk_index: chunk.chunk_index,
                    chunk_text: chunk.chunk_text.clone(),
                    document: entry.reference.clone(),
                });
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    /// Number of indexed documents.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Number of indexed chunks.
    pub fn chunk_count(&self) -> usize {
        self.documents.iter().map(|d| d.chunks.len()).sum()
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_ref(id: &str) -> DocumentRef {
        DocumentRef {
            document_id: id.to_string(),
            title: format!("doc {id}"),
            url: None,
            source: "template".to_string(),
        }
    }

    #[test]
    fn nearest_chunk_ranks_first() {
        let index = SimilarityIndex::new();
        index.upsert_document(
            doc_ref("a"),
            vec![
                (0, "about slack".into(), vec![1.0, 0.0, 0.0]),
                (1, "about email".into(), vec![0.0, 1.0, 0.0]),
            ],
        );
        index.upsert_document(
            doc_ref("b"),
            vec![(0, "about webhooks".into(), vec![0.0, 0.0, 1.0])],
        );

        let hits = index.search(&[0.9, 0.1, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_text, "about slack");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[0].document.document_id, "a");
    }

    #[test]
    fn scores_are_scale_invariant() {
        let index = SimilarityIndex::new();
        index.upsert_document(doc_ref("a"), vec![(0, "t".into(), vec![10.0, 0.0])]);

        let small = index.search(&[0.1, 0.0], 1);
        let large = index.search(&[100.0, 0.0], 1);
        assert!((small[0].score - large[0].score).abs() < 1e-6);
        assert!((small[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn upsert_replaces_previous_chunks() {
        let index = SimilarityIndex::new();
        index.upsert_document(
            doc_ref("a"),
            vec![(0, "old".into(), vec![1.0, 0.0]), (1, "old2".into(), vec![0.0, 1.0])],
        );
        index.upsert_document(doc_ref("a"), vec![(0, "new".into(), vec![1.0, 0.0])]);

        assert_eq!(index.chunk_count(), 1);
        let hits = index.search(&[1.0, 0.0], 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_text, "new");
    }

    #[test]
    fn removed_document_no_longer_matches() {
        let index = SimilarityIndex::new();
        index.upsert_document(doc_ref("a"), vec![(0, "t".into(), vec![1.0])]);
        index.remove_document("a");

        assert!(index.search(&[1.0], 5).is_empty());
        assert_eq!(index.document_count(), 0);
    }

    #[test]
    fn mismatched_dimensions_are_skipped() {
        let index = SimilarityIndex::new();
        index.upsert_document(doc_ref("a"), vec![(0, "t".into(), vec![1.0, 0.0])]);

        assert!(index.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn top_k_truncates() {
        let index = SimilarityIndex::new();
        for i in 0..10 {
            index.upsert_document(
                doc_ref(&format!("d{i}")),
                vec![(0, format!("chunk {i}"), vec![1.0, i as f32 / 10.0])],
            );
        }
        assert_eq!(index.search(&[1.0, 0.0], 3).len(), 3);
    }
}
