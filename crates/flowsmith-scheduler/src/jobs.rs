//! Built-in maintenance job handlers.
//!
//! These populate and groom the knowledge store on a cadence: sweeping
//! documents that still await embedding, and decaying freshness scores so
//! stale knowledge ranks lower over time.

use std::sync::Arc;

use flowsmith_retrieval::RetrievalEngine;
use flowsmith_store::KnowledgeStore;

use crate::scheduler::JobHandler;

/// Sweep up to `batch` documents awaiting embedding.
pub fn embed_pending_job(engine: Arc<RetrievalEngine>, batch: i64) -> JobHandler {
    Arc::new(move || {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            engine
                .embed_pending(batch)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    })
}

/// Multiplicatively decay freshness scores, clamped at `floor`.
pub fn freshness_decay_job(knowledge: KnowledgeStore, factor: f64, floor: f64) -> JobHandler {
    Arc::new(move || {
        let knowledge = knowledge.clone();
        Box::pin(async move {
            knowledge
                .decay_freshness(factor, floor)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use async_trait::async_trait;
    use flowsmith_retrieval::{EmbeddingBackend, RetrievalConfig};
    use flowsmith_store::{Database, DocumentSource, NewDocument, SchedulerStore};
    use std::time::Duration;

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingBackend for UnitEmbedder {
        async fn embed(&self, _text: &str) -> flowsmith_retrieval::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn embed_sweep_runs_on_schedule() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let knowledge = KnowledgeStore::new(db.clone());
        let engine = Arc::new(RetrievalEngine::new(
            knowledge.clone(),
            Arc::new(UnitEmbedder),
            RetrievalConfig::default(),
        ));

        engine
            .ingest(NewDocument {
                source: DocumentSource::DocPage,
                url: None,
                title: "t".into(),
                content: "some content".into(),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let scheduler = Scheduler::new(SchedulerStore::new(db));
        scheduler
            .register(
                "embed-pending",
                Duration::from_secs(60),
                embed_pending_job(Arc::clone(&engine), 16),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        scheduler.shutdown().await;

        let doc = knowledge.pending_embedding(10).await.unwrap();
        assert!(doc.is_empty(), "document should have been embedded by the sweep");
    }

    #[tokio::test(start_paused = true)]
    async fn decay_job_lowers_freshness() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let knowledge = KnowledgeStore::new(db.clone());

        let outcome = knowledge
            .ingest(NewDocument {
                source: DocumentSource::DocPage,
                url: None,
                title: "t".into(),
                content: "c".into(),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let scheduler = Scheduler::new(SchedulerStore::new(db));
        scheduler
            .register(
                "freshness-decay",
                Duration::from_secs(3600),
                freshness_decay_job(knowledge.clone(), 0.9, 0.1),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3605)).await;
        scheduler.shutdown().await;

        let doc = knowledge.get(&outcome.document().id).await.unwrap().unwrap();
        assert!(doc.freshness_score < 1.0);
        assert!(doc.freshness_score >= 0.1);
    }
}
