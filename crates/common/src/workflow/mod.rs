//! Workflow orchestrator
//!
//! The core of Careforge: owns the document state machine, sequences
//! the generation, render, signature, and index adapters, persists
//! every transition through the document store, and reconciles
//! asynchronous status events that may arrive out of order or
//! duplicated.
//!
//! Retry policy lives here, not in the adapters: transient adapter
//! errors are retried with capped exponential backoff and jitter, and
//! exhaustion moves the document to failed with the last cause
//! attached. Concurrent operations on the same document serialize
//! through the store's optimistic versioning.

pub mod sweep;

use crate::config::WorkflowConfig;
use crate::db::models::{Document, DocumentState, Role};
use crate::db::{update_document, DocumentFilter, DocumentStore};
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::generation::{templates, Generator};
use crate::index::{ComparisonIndex, ComparisonRecord, ScoredRecord};
use crate::render::Renderer;
use crate::signature::{EnvelopeStatus, SignatureProvider, Signer};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A document generation request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDocument {
    pub role: Role,
    pub template_id: String,
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub signers: Vec<Signer>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// The workflow orchestrator
pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    generator: Arc<dyn Generator>,
    renderer: Arc<dyn Renderer>,
    signatures: Arc<dyn SignatureProvider>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn ComparisonIndex>,
    config: WorkflowConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        generator: Arc<dyn Generator>,
        renderer: Arc<dyn Renderer>,
        signatures: Arc<dyn SignatureProvider>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn ComparisonIndex>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            generator,
            renderer,
            signatures,
            embedder,
            index,
            config,
        }
    }

    /// Access the document store (point lookups, listings)
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Create a document in the requested state.
    ///
    /// Role, template, and inputs are validated here, before anything
    /// is persisted or any external service is touched.
    #[instrument(skip(self, request), fields(role = %request.role, template_id = %request.template_id))]
    pub async fn create(&self, request: CreateDocument) -> Result<Document> {
        let template = templates::get(&request.template_id)?;
        // Fails fast on role mismatch or missing template variables
        template.build_prompt(request.role, &request.inputs)?;

        let metadata = serde_json::json!({
            "inputs": request.inputs,
            "signers": request.signers,
            "extra": request.metadata,
        });

        let doc = self
            .store
            .create(request.role, &request.template_id, metadata)
            .await?;

        metrics::counter!("careforge_documents_created_total", "role" => request.role.as_str())
            .increment(1);
        info!(document_id = %doc.id, "Document created");
        Ok(doc)
    }

    /// Generate the document content: requested -> drafted.
    ///
    /// Transient generation failures are retried up to the configured
    /// budget; exhaustion fails the document and surfaces
    /// `RetriesExhausted` with the last cause.
    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn draft(&self, id: Uuid) -> Result<Document> {
        let doc = self.expect_state(id, DocumentState::Requested, DocumentState::Drafted).await?;
        let role = doc.role()?;
        let inputs = document_inputs(&doc);
        let template_id = doc.template_id.clone();

        let generator = self.generator.clone();
        let generated = self
            .with_retries("generation", self.config.generation_max_attempts, || {
                let generator = generator.clone();
                let template_id = template_id.clone();
                let inputs = inputs.clone();
                async move { generator.generate(role, &template_id, &inputs).await }
            })
            .await;

        match generated {
            Ok(content) => {
                self.apply_transition(id, DocumentState::Drafted, |d| {
                    d.content = Some(content.clone());
                })
                .await
            }
            Err(e) if e.is_retryable() => {
                let err = AppError::RetriesExhausted {
                    attempts: self.config.generation_max_attempts,
                    last_state: DocumentState::Requested.to_string(),
                    source: Box::new(e),
                };
                self.fail_best_effort(id, &err.to_string()).await;
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    /// Render the drafted content to a PDF artifact: drafted -> rendered.
    ///
    /// Render failures are content problems: the document fails
    /// immediately, no retry.
    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn render(&self, id: Uuid) -> Result<Document> {
        let doc = self.expect_state(id, DocumentState::Drafted, DocumentState::Rendered).await?;
        let content = doc.content.clone().ok_or_else(|| AppError::Internal {
            message: format!("Drafted document {} has no content", id),
        })?;

        let template = templates::get(&doc.template_id)?;
        let inputs = document_inputs(&doc);
        let subject = inputs
            .get("name")
            .cloned()
            .unwrap_or_else(|| doc.id.to_string());
        let title = format!("{} - {}", template.title, subject);

        match self.renderer.render(&title, &content, &doc.template_id).await {
            Ok(blob_ref) => {
                self.apply_transition(id, DocumentState::Rendered, |d| {
                    d.rendered_blob_ref = Some(blob_ref.clone());
                })
                .await
            }
            Err(e) => {
                self.fail_best_effort(id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Create the signature envelope: rendered -> sent.
    ///
    /// Signers come from the generation request; envelope creation is
    /// retried on transient provider errors.
    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn send(&self, id: Uuid) -> Result<Document> {
        let doc = self.expect_state(id, DocumentState::Rendered, DocumentState::Sent).await?;
        let signers = document_signers(&doc);
        if signers.is_empty() {
            return Err(AppError::Validation {
                message: format!("Document {} has no signers", id),
                field: Some("signers".into()),
            });
        }

        let signatures = self.signatures.clone();
        let doc_for_envelope = doc.clone();
        let created = self
            .with_retries("envelope", self.config.send_max_attempts, || {
                let signatures = signatures.clone();
                let doc = doc_for_envelope.clone();
                let signers = signers.clone();
                async move { signatures.create_envelope(&doc, &signers).await }
            })
            .await;

        match created {
            Ok(envelope_id) => {
                self.apply_transition(id, DocumentState::Sent, |d| {
                    d.envelope_id = Some(envelope_id.clone());
                })
                .await
            }
            Err(e) if e.is_retryable() => {
                let err = AppError::RetriesExhausted {
                    attempts: self.config.send_max_attempts,
                    last_state: DocumentState::Rendered.to_string(),
                    source: Box::new(e),
                };
                self.fail_best_effort(id, &err.to_string()).await;
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    /// Drive a document from requested through sent
    pub async fn advance(&self, id: Uuid) -> Result<Document> {
        let mut doc = self.store.get(id).await?;
        loop {
            doc = match doc.document_state() {
                DocumentState::Requested => self.draft(id).await?,
                DocumentState::Drafted => self.render(id).await?,
                DocumentState::Rendered => self.send(id).await?,
                _ => return Ok(doc),
            };
        }
    }

    /// Issue an embedded signing URL for a signer of a sent document
    pub async fn signing_url(&self, id: Uuid, client_user_id: Option<&str>) -> Result<String> {
        let doc = self.store.get(id).await?;
        let envelope_id = doc.envelope_id.clone().ok_or_else(|| AppError::InvalidTransition {
            id: id.to_string(),
            from: doc.state.clone(),
            to: DocumentState::Sent.to_string(),
        })?;

        let signers = document_signers(&doc);
        let signer = match client_user_id {
            Some(cuid) => signers
                .iter()
                .find(|s| s.client_user_id == cuid)
                .cloned()
                .ok_or_else(|| AppError::NotFound {
                    resource_type: "signer".into(),
                    id: cuid.into(),
                })?,
            None => signers.first().cloned().ok_or_else(|| AppError::Validation {
                message: format!("Document {} has no signers", id),
                field: Some("signers".into()),
            })?,
        };

        self.signatures.signing_url(&envelope_id, &signer).await
    }

    // ========================================================================
    // Status reconciliation
    // ========================================================================

    /// Merge an asynchronously received envelope status into the
    /// document's lifecycle state.
    ///
    /// Idempotent and monotonic: duplicate events are no-ops, stale
    /// events (older than the recorded state) are ignored and logged,
    /// and events for documents already in a terminal state are
    /// discarded. State never regresses.
    #[instrument(skip(self), fields(document_id = %id, status = %status))]
    pub async fn reconcile(&self, id: Uuid, status: EnvelopeStatus) -> Result<Document> {
        metrics::counter!("careforge_status_events_total", "status" => status.as_str())
            .increment(1);

        let target = match status {
            EnvelopeStatus::Signed => DocumentState::Signed,
            EnvelopeStatus::Declined | EnvelopeStatus::Voided => DocumentState::Declined,
            // Pre-completion provider states carry no transition
            EnvelopeStatus::Created | EnvelopeStatus::Sent | EnvelopeStatus::Delivered => {
                let doc = self.store.get(id).await?;
                debug!("Status event carries no transition");
                return Ok(doc);
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let doc = self.store.get(id).await?;
            let current = doc.document_state();

            if current == target {
                debug!(state = %current, "Duplicate status event, no-op");
                return Ok(doc);
            }
            if current.is_terminal() || target.rank() <= current.rank() {
                warn!(
                    state = %current,
                    "Ignoring stale status event for settled document"
                );
                return Ok(doc);
            }
            if !current.can_transition(target) {
                // The event outran the pipeline (e.g. a webhook racing
                // envelope creation); it will be re-delivered or swept up
                // by the next poll.
                warn!(state = %current, "Status event does not apply yet, ignoring");
                return Ok(doc);
            }

            let mut updated = doc;
            updated.state = target.as_str().to_string();
            match self.store.put_versioned(updated).await {
                Ok(stored) => {
                    info!(state = %target, "Document transitioned");
                    metrics::counter!("careforge_document_transitions_total", "state" => target.as_str())
                        .increment(1);
                    return Ok(stored);
                }
                Err(AppError::Conflict { .. }) if attempt < self.config.conflict_max_attempts => {
                    debug!(attempt, "Reconcile raced another update, retrying");
                }
                Err(AppError::Conflict { .. }) => {
                    return Err(AppError::ConcurrentUpdate {
                        id: id.to_string(),
                        attempts: self.config.conflict_max_attempts,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll the provider for a sent document and reconcile the result
    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn poll(&self, id: Uuid) -> Result<Document> {
        let doc = self.store.get(id).await?;
        if doc.is_terminal() {
            debug!("Skipping poll for terminal document");
            return Ok(doc);
        }
        let envelope_id = doc.envelope_id.clone().ok_or_else(|| AppError::InvalidTransition {
            id: id.to_string(),
            from: doc.state.clone(),
            to: DocumentState::Sent.to_string(),
        })?;

        metrics::counter!("careforge_status_polls_total").increment(1);
        let status = self.signatures.envelope_status(&envelope_id).await?;
        self.reconcile(id, status).await
    }

    // ========================================================================
    // Comparison indexing
    // ========================================================================

    /// Embed and upsert a signed document: signed -> indexed
    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn index_document(&self, id: Uuid) -> Result<Document> {
        let doc = self.expect_state(id, DocumentState::Signed, DocumentState::Indexed).await?;
        let content = doc.content.clone().ok_or_else(|| AppError::Internal {
            message: format!("Signed document {} has no content", id),
        })?;

        let embedder = self.embedder.clone();
        let index = self.index.clone();
        let record_doc = doc.clone();
        let upserted = self
            .with_retries("index_upsert", self.config.index_max_attempts, || {
                let embedder = embedder.clone();
                let index = index.clone();
                let doc = record_doc.clone();
                let content = content.clone();
                async move {
                    let vector = embedder.embed(&content).await?;
                    index.upsert(document_record(&doc, vector)).await
                }
            })
            .await;

        match upserted {
            Ok(()) => self.apply_transition(id, DocumentState::Indexed, |_| {}).await,
            Err(e) if e.is_retryable() => {
                let err = AppError::RetriesExhausted {
                    attempts: self.config.index_max_attempts,
                    last_state: DocumentState::Signed.to_string(),
                    source: Box::new(e),
                };
                self.fail_best_effort(id, &err.to_string()).await;
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    /// Embed and upsert reference insurance plans
    pub async fn index_reference_plans(
        &self,
        plans: &[crate::index::plans::ReferencePlan],
    ) -> Result<usize> {
        crate::index::plans::index_reference_plans(&self.index, &self.embedder, plans).await
    }

    /// Re-upsert every indexed document. Idempotent: re-running
    /// replaces each record wholesale, never duplicates.
    pub async fn reindex_documents(&self) -> Result<usize> {
        let docs = self
            .store
            .list(DocumentFilter::by_state(DocumentState::Indexed))
            .await?;

        let mut count = 0;
        for doc in docs {
            let Some(content) = doc.content.clone() else {
                warn!(document_id = %doc.id, "Indexed document has no content, skipping");
                continue;
            };
            let vector = self.embedder.embed(&content).await?;
            self.index.upsert(document_record(&doc, vector)).await?;
            count += 1;
        }

        info!(count, "Reindexed documents");
        Ok(count)
    }

    /// Read-only similarity query over documents and reference plans
    pub async fn compare(&self, query: &str, k: usize) -> Result<Vec<ScoredRecord>> {
        let vector = self.embedder.embed_query(query).await?;
        self.index.query(&vector, k).await
    }

    // ========================================================================
    // Administrative
    // ========================================================================

    /// Mark a document failed from any non-terminal state
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<Document> {
        self.apply_transition(id, DocumentState::Failed, |d| {
            d.error_message = Some(reason.to_string());
        })
        .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Fetch the document and require a specific lifecycle state
    async fn expect_state(
        &self,
        id: Uuid,
        expected: DocumentState,
        target: DocumentState,
    ) -> Result<Document> {
        let doc = self.store.get(id).await?;
        let current = doc.document_state();
        if current != expected {
            return Err(AppError::InvalidTransition {
                id: id.to_string(),
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        Ok(doc)
    }

    /// Guarded transition through the bounded read-modify-write loop.
    /// The transition table is re-checked inside the mutator, so a
    /// result arriving after an administrative fail is discarded with
    /// an `InvalidTransition` instead of overwriting terminal state.
    async fn apply_transition<F>(&self, id: Uuid, to: DocumentState, set: F) -> Result<Document>
    where
        F: Fn(&mut Document) + Send + Sync,
    {
        let doc = update_document(
            self.store.as_ref(),
            id,
            self.config.conflict_max_attempts,
            |d| {
                let from = d.document_state();
                if !from.can_transition(to) {
                    return Err(AppError::InvalidTransition {
                        id: id.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                d.state = to.as_str().to_string();
                set(d);
                Ok(())
            },
        )
        .await?;

        info!(document_id = %id, state = %to, "Document transitioned");
        metrics::counter!("careforge_document_transitions_total", "state" => to.as_str())
            .increment(1);
        Ok(doc)
    }

    /// Mark a document failed without masking the original error
    async fn fail_best_effort(&self, id: Uuid, reason: &str) {
        if let Err(e) = self.fail(id, reason).await {
            warn!(document_id = %id, error = %e, "Could not mark document failed");
        }
    }

    /// Capped exponential backoff with jitter: between half and the
    /// full exponential delay for the attempt
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.config.backoff_base_ms.saturating_mul(1u64 << shift);
        let capped = exp.min(self.config.backoff_cap_ms).max(1);
        let jitter = rand::thread_rng().gen_range(0..=capped - capped / 2);
        Duration::from_millis(capped / 2 + jitter)
    }

    /// Run a retryable adapter call up to `max_attempts` times.
    /// Non-retryable errors propagate immediately.
    async fn with_retries<T, F, Fut>(&self, op: &str, max_attempts: u32, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }
            let started = std::time::Instant::now();
            match f().await {
                Ok(value) => {
                    metrics::histogram!("careforge_adapter_duration_seconds", "op" => op.to_string())
                        .record(started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        op,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Adapter call failed, retrying"
                    );
                    metrics::counter!("careforge_adapter_retries_total", "op" => op.to_string())
                        .increment(1);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::Internal {
            message: format!("{} retry loop made no attempts", op),
        }))
    }
}

/// Inputs captured at creation time
fn document_inputs(doc: &Document) -> HashMap<String, String> {
    doc.metadata
        .get("inputs")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Signers captured at creation time
fn document_signers(doc: &Document) -> Vec<Signer> {
    doc.metadata
        .get("signers")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Comparison record for an indexed document
fn document_record(doc: &Document, vector: Vec<f32>) -> ComparisonRecord {
    let metadata = serde_json::json!({
        "kind": "document",
        "document_id": doc.id,
        "role": doc.role,
        "template_id": doc.template_id,
        "extra": doc.metadata.get("extra").cloned().unwrap_or(serde_json::Value::Null),
    });
    ComparisonRecord::new(&format!("doc:{}", doc.id), vector, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDocumentStore;
    use crate::embeddings::MockEmbedder;
    use crate::generation::MockGenerator;
    use crate::index::MemoryIndex;
    use crate::render::MockRenderer;
    use crate::signature::MockSignatureProvider;

    struct Fixture {
        orchestrator: Orchestrator,
        generator: Arc<MockGenerator>,
        renderer: Arc<MockRenderer>,
        signatures: Arc<MockSignatureProvider>,
        index: Arc<MemoryIndex>,
    }

    fn fixture(
        generator: MockGenerator,
        renderer: MockRenderer,
        signatures: MockSignatureProvider,
    ) -> Fixture {
        let generator = Arc::new(generator);
        let renderer = Arc::new(renderer);
        let signatures = Arc::new(signatures);
        let index = Arc::new(MemoryIndex::new());
        let embedder = Arc::new(MockEmbedder::new(64));

        let config = WorkflowConfig {
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            ..WorkflowConfig::default()
        };

        let orchestrator = Orchestrator::new(
            Arc::new(MemoryDocumentStore::new()),
            generator.clone(),
            renderer.clone(),
            signatures.clone(),
            embedder.clone(),
            index.clone(),
            config,
        );

        Fixture {
            orchestrator,
            generator,
            renderer,
            signatures,
            index,
        }
    }

    fn happy_fixture() -> Fixture {
        fixture(
            MockGenerator::new("{\"patient_information\": {\"name\": \"Jane Doe\"}}"),
            MockRenderer::new(),
            MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Signed]),
        )
    }

    fn patient_request() -> CreateDocument {
        CreateDocument {
            role: Role::Patient,
            template_id: "patient_consent".into(),
            inputs: [("name".to_string(), "Jane Doe".to_string())].into(),
            signers: vec![Signer::new("Jane Doe", "jane@example.test", "1000")],
            metadata: serde_json::json!({"requester": "r-1"}),
        }
    }

    #[tokio::test]
    async fn test_happy_path_to_indexed() {
        let f = happy_fixture();

        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Requested);

        let doc = f.orchestrator.advance(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Sent);
        assert!(doc.content.as_deref().unwrap().contains("Jane Doe"));
        assert!(doc.rendered_blob_ref.is_some());
        assert_eq!(doc.envelope_id.as_deref(), Some("E1"));

        let doc = f.orchestrator.poll(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Signed);

        let doc = f.orchestrator.index_document(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Indexed);

        // Round-trip: querying with the document's own content returns it on top
        let results = f
            .orchestrator
            .compare(doc.content.as_deref().unwrap(), 5)
            .await
            .unwrap();
        assert_eq!(results[0].record_id, format!("doc:{}", doc.id));
    }

    #[tokio::test]
    async fn test_state_never_skips_a_step() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();

        // requested -> sent directly is rejected
        let err = f.orchestrator.send(doc.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        // requested -> rendered directly is rejected
        let err = f.orchestrator.render(doc.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        // and no adapter was touched
        assert_eq!(f.renderer.calls(), 0);
    }

    #[tokio::test]
    async fn test_create_validates_inputs_before_persisting() {
        let f = happy_fixture();
        let request = CreateDocument {
            inputs: HashMap::new(),
            ..patient_request()
        };
        let err = f.orchestrator.create(request).await.unwrap_err();
        assert!(matches!(err, AppError::TemplateInput { .. }));

        let all = f
            .orchestrator
            .store()
            .list(DocumentFilter::default())
            .await
            .unwrap();
        assert!(all.is_empty(), "failed create must not persist a document");
    }

    #[tokio::test]
    async fn test_unknown_role_string_is_rejected() {
        let err = Role::try_from("superuser").unwrap_err();
        assert!(matches!(err, AppError::UnknownRole { .. }));
    }

    #[tokio::test]
    async fn test_generation_exhausts_retries_and_fails() {
        let f = fixture(
            MockGenerator::always_failing(),
            MockRenderer::new(),
            MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Sent]),
        );

        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        let err = f.orchestrator.draft(doc.id).await.unwrap_err();

        match &err {
            AppError::RetriesExhausted {
                attempts,
                last_state,
                source,
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last_state, "requested");
                assert!(matches!(**source, AppError::GenerationUnavailable { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(f.generator.calls(), 3);
        let doc = f.orchestrator.store().get(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Failed);
        assert!(doc.error_message.is_some());
    }

    #[tokio::test]
    async fn test_transient_generation_failure_recovers() {
        let f = fixture(
            MockGenerator::failing_times("{\"ok\": true}", 2),
            MockRenderer::new(),
            MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Sent]),
        );

        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        let doc = f.orchestrator.draft(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Drafted);
        assert_eq!(f.generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_render_failure_is_not_retried() {
        let f = fixture(
            MockGenerator::new("{\"ok\": true}"),
            MockRenderer::failing(),
            MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Sent]),
        );

        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.draft(doc.id).await.unwrap();
        let err = f.orchestrator.render(doc.id).await.unwrap_err();
        assert!(matches!(err, AppError::Render { .. }));

        assert_eq!(f.renderer.calls(), 1, "render must not be retried");
        let doc = f.orchestrator.store().get(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Failed);
    }

    #[tokio::test]
    async fn test_declined_envelope_is_a_business_outcome() {
        let f = fixture(
            MockGenerator::new("{\"ok\": true}"),
            MockRenderer::new(),
            MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Declined]),
        );

        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        let doc = f.orchestrator.advance(doc.id).await.unwrap();
        let doc = f.orchestrator.poll(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Declined);
        assert!(doc.envelope_id.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.advance(doc.id).await.unwrap();

        let first = f
            .orchestrator
            .reconcile(doc.id, EnvelopeStatus::Signed)
            .await
            .unwrap();
        assert_eq!(first.document_state(), DocumentState::Signed);

        // Applying the same event again changes nothing, not even the version
        let second = f
            .orchestrator
            .reconcile(doc.id, EnvelopeStatus::Signed)
            .await
            .unwrap();
        assert_eq!(second.document_state(), DocumentState::Signed);
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn test_out_of_order_events_never_regress_state() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.advance(doc.id).await.unwrap();

        f.orchestrator
            .reconcile(doc.id, EnvelopeStatus::Signed)
            .await
            .unwrap();

        // A late declined event must not displace the recorded outcome
        let doc = f
            .orchestrator
            .reconcile(doc.id, EnvelopeStatus::Declined)
            .await
            .unwrap();
        assert_eq!(doc.document_state(), DocumentState::Signed);

        // Neither does a stale delivery notification
        let doc = f
            .orchestrator
            .reconcile(doc.id, EnvelopeStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(doc.document_state(), DocumentState::Signed);
    }

    #[tokio::test]
    async fn test_pre_completion_statuses_are_no_ops() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        let sent = f.orchestrator.advance(doc.id).await.unwrap();

        for status in [
            EnvelopeStatus::Created,
            EnvelopeStatus::Sent,
            EnvelopeStatus::Delivered,
        ] {
            let doc = f.orchestrator.reconcile(doc.id, status).await.unwrap();
            assert_eq!(doc.document_state(), DocumentState::Sent);
            assert_eq!(doc.version, sent.version);
        }
    }

    #[tokio::test]
    async fn test_administrative_fail_discards_late_results() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.advance(doc.id).await.unwrap();

        f.orchestrator.fail(doc.id, "cancelled by operator").await.unwrap();

        // A signature result completing afterwards is discarded
        let doc = f
            .orchestrator
            .reconcile(doc.id, EnvelopeStatus::Signed)
            .await
            .unwrap();
        assert_eq!(doc.document_state(), DocumentState::Failed);

        // And terminal documents reject administrative failure too
        let err = f.orchestrator.fail(doc.id, "again").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_signing_url_requires_a_sent_document() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();

        let err = f.orchestrator.signing_url(doc.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        f.orchestrator.advance(doc.id).await.unwrap();
        let url = f.orchestrator.signing_url(doc.id, None).await.unwrap();
        assert!(url.contains("E1"));

        let err = f
            .orchestrator
            .signing_url(doc.id, Some("no-such-signer"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_compare_rejects_zero_k() {
        let f = happy_fixture();
        let err = f.orchestrator.compare("any plan", 0).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.advance(doc.id).await.unwrap();
        f.orchestrator.poll(doc.id).await.unwrap();
        f.orchestrator.index_document(doc.id).await.unwrap();
        assert_eq!(f.index.len().await, 1);

        let count = f.orchestrator.reindex_documents().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(f.index.len().await, 1, "reindex must not duplicate records");
    }

    #[tokio::test]
    async fn test_index_upsert_failure_exhausts_and_fails() {
        // An embedder that always fails stands in for an unavailable
        // index path.
        struct FailingEmbedder;

        #[async_trait::async_trait]
        impl Embedder for FailingEmbedder {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Err(AppError::Embedding {
                    message: "index store timeout".into(),
                })
            }
            async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Err(AppError::Embedding {
                    message: "index store timeout".into(),
                })
            }
            async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
                Err(AppError::Embedding {
                    message: "index store timeout".into(),
                })
            }
            fn model_name(&self) -> &str {
                "failing"
            }
            fn dimension(&self) -> usize {
                0
            }
        }

        let f = happy_fixture();
        let orchestrator = Orchestrator::new(
            f.orchestrator.store().clone(),
            f.generator.clone(),
            f.renderer.clone(),
            f.signatures.clone(),
            Arc::new(FailingEmbedder),
            f.index.clone(),
            WorkflowConfig {
                backoff_base_ms: 1,
                backoff_cap_ms: 5,
                ..WorkflowConfig::default()
            },
        );

        let doc = orchestrator.create(patient_request()).await.unwrap();
        orchestrator.advance(doc.id).await.unwrap();
        orchestrator.poll(doc.id).await.unwrap();

        let err = orchestrator.index_document(doc.id).await.unwrap_err();
        assert!(matches!(err, AppError::RetriesExhausted { .. }));

        let doc = orchestrator.store().get(doc.id).await.unwrap();
        assert_eq!(doc.document_state(), DocumentState::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_and_fail_settle_once() {
        let f = happy_fixture();
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.advance(doc.id).await.unwrap();

        let orchestrator = Arc::new(f.orchestrator);
        let a = {
            let o = orchestrator.clone();
            let id = doc.id;
            tokio::spawn(async move { o.reconcile(id, EnvelopeStatus::Signed).await })
        };
        let b = {
            let o = orchestrator.clone();
            let id = doc.id;
            tokio::spawn(async move { o.fail(id, "operator cancel").await })
        };

        let _ = a.await.unwrap();
        let _ = b.await.unwrap();

        // Whichever write lost re-read current state; the document holds
        // exactly one settled outcome.
        let doc = orchestrator.store().get(doc.id).await.unwrap();
        let state = doc.document_state();
        assert!(
            state == DocumentState::Signed || state == DocumentState::Failed,
            "unexpected settled state: {state}"
        );
    }

    #[tokio::test]
    async fn test_poll_skips_terminal_documents() {
        let f = fixture(
            MockGenerator::new("{\"ok\": true}"),
            MockRenderer::new(),
            MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Signed]),
        );
        let doc = f.orchestrator.create(patient_request()).await.unwrap();
        f.orchestrator.advance(doc.id).await.unwrap();
        f.orchestrator.fail(doc.id, "cancelled").await.unwrap();

        f.orchestrator.poll(doc.id).await.unwrap();
        assert_eq!(f.signatures.status_calls(), 0, "terminal documents are not polled");
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let f = happy_fixture();
        for attempt in 1..20 {
            let delay = f.orchestrator.backoff_delay(attempt);
            assert!(delay <= Duration::from_millis(5));
        }
    }
}
