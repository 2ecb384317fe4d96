//! Document store abstraction
//!
//! The workflow orchestrator persists every lifecycle transition through
//! this trait. Updates are optimistic: a record is replaced wholesale,
//! keyed by the version the caller read, and a stale version fails with
//! a conflict so concurrent reconciliations never double-apply a
//! transition.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{Document, DocumentState, Role};
use crate::errors::{AppError, Result};

/// Filter for document listings
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub state: Option<DocumentState>,
    pub role: Option<Role>,
    pub limit: Option<u64>,
}

impl DocumentFilter {
    /// Filter on a single lifecycle state
    pub fn by_state(state: DocumentState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

/// Durable record of each document's identity, content, and lifecycle state
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document in the requested state
    async fn create(
        &self,
        role: Role,
        template_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Document>;

    /// Point lookup by id
    async fn get(&self, id: Uuid) -> Result<Document>;

    /// Replace the stored record iff its version still equals
    /// `doc.version`, bumping the version and `updated_at`. A stale
    /// version fails with `Conflict` and the caller re-reads.
    async fn put_versioned(&self, doc: Document) -> Result<Document>;

    /// Filtered listing, newest first
    async fn list(&self, filter: DocumentFilter) -> Result<Vec<Document>>;
}

/// Bounded optimistic read-modify-write.
///
/// Re-reads and re-applies `mutate` on every conflict, up to
/// `max_attempts`; past the bound the conflict surfaces as
/// `ConcurrentUpdate`. Mutator errors (e.g. an invalid transition)
/// propagate unchanged.
pub async fn update_document<F>(
    store: &dyn DocumentStore,
    id: Uuid,
    max_attempts: u32,
    mutate: F,
) -> Result<Document>
where
    F: Fn(&mut Document) -> Result<()> + Send + Sync,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut doc = store.get(id).await?;
        mutate(&mut doc)?;
        match store.put_versioned(doc).await {
            Ok(stored) => return Ok(stored),
            Err(AppError::Conflict { .. }) if attempt < max_attempts => {
                tracing::debug!(
                    document_id = %id,
                    attempt,
                    "Conflicting document update, retrying"
                );
            }
            Err(AppError::Conflict { .. }) => {
                return Err(AppError::ConcurrentUpdate {
                    id: id.to_string(),
                    attempts: max_attempts,
                })
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-process store backing tests and single-node deployments
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<Uuid, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(
        &self,
        role: Role,
        template_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Document> {
        let doc = Document::new(role, template_id, metadata);
        self.docs.write().await.insert(doc.id, doc.clone());
        Ok(doc)
    }

    async fn get(&self, id: Uuid) -> Result<Document> {
        self.docs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })
    }

    async fn put_versioned(&self, mut doc: Document) -> Result<Document> {
        let mut docs = self.docs.write().await;
        let current = docs
            .get(&doc.id)
            .ok_or_else(|| AppError::DocumentNotFound {
                id: doc.id.to_string(),
            })?;

        if current.version != doc.version {
            return Err(AppError::Conflict {
                id: doc.id.to_string(),
                expected: doc.version,
            });
        }

        doc.version += 1;
        doc.updated_at = chrono::Utc::now().into();
        docs.insert(doc.id, doc.clone());
        Ok(doc)
    }

    async fn list(&self, filter: DocumentFilter) -> Result<Vec<Document>> {
        let docs = self.docs.read().await;
        let mut result: Vec<Document> = docs
            .values()
            .filter(|d| {
                filter
                    .state
                    .map_or(true, |s| d.document_state() == s)
            })
            .filter(|d| {
                filter
                    .role
                    .map_or(true, |r| d.role.as_str() == r.as_str())
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            result.truncate(limit as usize);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryDocumentStore::new();
        let doc = store
            .create(Role::Patient, "T1", serde_json::json!({}))
            .await
            .unwrap();
        let fetched = store.get(doc.id).await.unwrap();
        assert_eq!(fetched.id, doc.id);
        assert_eq!(fetched.document_state(), DocumentState::Requested);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_versioned_bumps_version() {
        let store = MemoryDocumentStore::new();
        let mut doc = store
            .create(Role::Insurer, "T2", serde_json::json!({}))
            .await
            .unwrap();
        doc.content = Some("draft text".into());
        let stored = store.put_versioned(doc).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.content.as_deref(), Some("draft text"));
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryDocumentStore::new();
        let doc = store
            .create(Role::Provider, "T1", serde_json::json!({}))
            .await
            .unwrap();

        // Two writers read the same version; exactly one wins.
        let mut first = doc.clone();
        first.content = Some("writer one".into());
        let mut second = doc;
        second.content = Some("writer two".into());

        store.put_versioned(first).await.unwrap();
        let err = store.put_versioned(second).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_document_retries_past_conflicts() {
        let store = Arc::new(MemoryDocumentStore::new());
        let doc = store
            .create(Role::Pharmacy, "T3", serde_json::json!({"count": 0}))
            .await
            .unwrap();

        // Concurrent mutators; both must land exactly once.
        let a = {
            let store = store.clone();
            let id = doc.id;
            tokio::spawn(async move {
                update_document(store.as_ref(), id, 5, |d| {
                    let n = d.metadata["count"].as_i64().unwrap_or(0);
                    d.metadata = serde_json::json!({ "count": n + 1 });
                    Ok(())
                })
                .await
            })
        };
        let b = {
            let store = store.clone();
            let id = doc.id;
            tokio::spawn(async move {
                update_document(store.as_ref(), id, 5, |d| {
                    let n = d.metadata["count"].as_i64().unwrap_or(0);
                    d.metadata = serde_json::json!({ "count": n + 1 });
                    Ok(())
                })
                .await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let final_doc = store.get(doc.id).await.unwrap();
        assert_eq!(final_doc.metadata["count"], 2);
        assert_eq!(final_doc.version, 3);
    }

    #[tokio::test]
    async fn test_update_document_surfaces_bounded_failure() {
        let store = MemoryDocumentStore::new();
        let doc = store
            .create(Role::Patient, "T1", serde_json::json!({}))
            .await
            .unwrap();

        // Mutator that always resets to a stale version, forcing a
        // conflict on every attempt.
        let err = update_document(&store, doc.id, 3, |d| {
            d.version = 0;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            AppError::ConcurrentUpdate { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_state() {
        let store = MemoryDocumentStore::new();
        let doc = store
            .create(Role::Patient, "T1", serde_json::json!({}))
            .await
            .unwrap();
        store
            .create(Role::Insurer, "T2", serde_json::json!({}))
            .await
            .unwrap();

        update_document(&store, doc.id, 3, |d| {
            d.state = DocumentState::Drafted.as_str().to_string();
            d.content = Some("text".into());
            Ok(())
        })
        .await
        .unwrap();

        let drafted = store
            .list(DocumentFilter::by_state(DocumentState::Drafted))
            .await
            .unwrap();
        assert_eq!(drafted.len(), 1);
        assert_eq!(drafted[0].id, doc.id);

        let requested = store
            .list(DocumentFilter::by_state(DocumentState::Requested))
            .await
            .unwrap();
        assert_eq!(requested.len(), 1);
    }
}
