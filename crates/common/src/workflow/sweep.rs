//! Status sweep
//!
//! One pass of the background reconciliation loop: poll every sent
//! document with bounded concurrency, then move freshly signed
//! documents into the comparison index. A transient poll failure
//! leaves its document in sent for the next sweep.

use crate::db::models::DocumentState;
use crate::db::DocumentFilter;
use crate::errors::Result;
use crate::workflow::Orchestrator;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

/// Outcome of a single sweep pass
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub polled: usize,
    pub poll_failures: usize,
    pub indexed: usize,
    pub index_failures: usize,
}

impl SweepStats {
    /// True when every poll and index attempt failed
    pub fn all_failed(&self) -> bool {
        self.polled == 0
            && self.indexed == 0
            && (self.poll_failures > 0 || self.index_failures > 0)
    }
}

/// Run one sweep over sent and signed documents
pub async fn run_sweep(orchestrator: &Orchestrator, concurrency: usize) -> Result<SweepStats> {
    metrics::counter!("careforge_sweeps_total").increment(1);
    let mut stats = SweepStats::default();

    let sent = orchestrator
        .store()
        .list(DocumentFilter::by_state(DocumentState::Sent))
        .await?;

    let results: Vec<_> = stream::iter(sent.into_iter().map(|doc| async move {
        (doc.id, orchestrator.poll(doc.id).await)
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

    for (id, result) in results {
        match result {
            Ok(_) => stats.polled += 1,
            Err(e) => {
                warn!(document_id = %id, error = %e, "Status poll failed");
                stats.poll_failures += 1;
            }
        }
    }

    let signed = orchestrator
        .store()
        .list(DocumentFilter::by_state(DocumentState::Signed))
        .await?;

    for doc in signed {
        match orchestrator.index_document(doc.id).await {
            Ok(_) => stats.indexed += 1,
            Err(e) => {
                warn!(document_id = %doc.id, error = %e, "Index upsert failed");
                stats.index_failures += 1;
            }
        }
    }

    if stats.polled + stats.poll_failures + stats.indexed + stats.index_failures > 0 {
        info!(
            polled = stats.polled,
            poll_failures = stats.poll_failures,
            indexed = stats.indexed,
            index_failures = stats.index_failures,
            "Sweep complete"
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::db::models::Role;
    use crate::db::MemoryDocumentStore;
    use crate::embeddings::MockEmbedder;
    use crate::generation::MockGenerator;
    use crate::index::MemoryIndex;
    use crate::render::MockRenderer;
    use crate::signature::{EnvelopeStatus, MockSignatureProvider, Signer};
    use crate::workflow::CreateDocument;
    use std::sync::Arc;

    fn orchestrator(signatures: MockSignatureProvider) -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MockGenerator::new("{\"ok\": true}")),
            Arc::new(MockRenderer::new()),
            Arc::new(signatures),
            Arc::new(MockEmbedder::new(32)),
            Arc::new(MemoryIndex::new()),
            WorkflowConfig {
                backoff_base_ms: 1,
                backoff_cap_ms: 5,
                ..WorkflowConfig::default()
            },
        )
    }

    fn request(name: &str) -> CreateDocument {
        CreateDocument {
            role: Role::Patient,
            template_id: "patient_consent".into(),
            inputs: [("name".to_string(), name.to_string())].into(),
            signers: vec![Signer::new(name, "signer@example.test", "1000")],
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_sweep_drives_sent_documents_to_indexed() {
        let o = orchestrator(MockSignatureProvider::with_statuses(vec![
            EnvelopeStatus::Signed,
        ]));

        let a = o.create(request("Jane Doe")).await.unwrap();
        let b = o.create(request("John Roe")).await.unwrap();
        o.advance(a.id).await.unwrap();
        o.advance(b.id).await.unwrap();

        let stats = run_sweep(&o, 4).await.unwrap();
        assert_eq!(stats.polled, 2);
        assert_eq!(stats.poll_failures, 0);
        assert_eq!(stats.indexed, 2);

        for id in [a.id, b.id] {
            let doc = o.store().get(id).await.unwrap();
            assert_eq!(doc.document_state(), DocumentState::Indexed);
        }
    }

    #[tokio::test]
    async fn test_sweep_counts_transient_poll_failures() {
        // An empty status sequence makes every status call fail
        let o = orchestrator(MockSignatureProvider::with_statuses(vec![]));

        let doc = o.create(request("Jane Doe")).await.unwrap();
        o.advance(doc.id).await.unwrap();

        let stats = run_sweep(&o, 4).await.unwrap();
        assert_eq!(stats.polled, 0);
        assert_eq!(stats.poll_failures, 1);
        assert!(stats.all_failed());

        // The document stays in sent for the next sweep
        let doc = o.store().get(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Sent);
    }

    #[tokio::test]
    async fn test_sweep_is_quiet_when_nothing_pending() {
        let o = orchestrator(MockSignatureProvider::with_statuses(vec![
            EnvelopeStatus::Signed,
        ]));
        let stats = run_sweep(&o, 4).await.unwrap();
        assert_eq!(stats.polled + stats.indexed, 0);
        assert!(!stats.all_failed());
    }
}
