//! Service bootstrap
//!
//! Assembles the orchestrator from configuration: store and index
//! backends, adapters, and the workflow settings. The memory backends
//! are single-process; a deployment split across services uses the
//! postgres backends.

use crate::config::AppConfig;
use crate::db::{DbPool, DocumentStore, MemoryDocumentStore, PgDocumentStore};
use crate::embeddings;
use crate::errors::Result;
use crate::generation;
use crate::index;
use crate::render;
use crate::signature;
use crate::workflow::Orchestrator;
use std::sync::Arc;
use tracing::info;

/// Assembled service dependencies
pub struct Services {
    pub orchestrator: Arc<Orchestrator>,
    pub db: Option<DbPool>,
}

/// Build the orchestrator and its adapters from configuration
pub async fn build(config: &AppConfig) -> Result<Services> {
    let needs_db =
        config.database.backend == "postgres" || config.index.backend == "pgvector";
    let db = if needs_db {
        Some(DbPool::new(&config.database).await?)
    } else {
        None
    };

    let store: Arc<dyn DocumentStore> = match config.database.backend.as_str() {
        "postgres" => Arc::new(PgDocumentStore::new(
            db.clone().expect("postgres store requires a database pool"),
        )),
        "memory" => Arc::new(MemoryDocumentStore::new()),
        other => {
            tracing::warn!(backend = other, "Unknown store backend, using memory");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let generator = generation::create_generator(&config.generation);
    let renderer = render::create_renderer(&config.render);
    let signatures = signature::create_signature_provider(&config.signature);
    let embedder = embeddings::create_embedder(&config.embedding);
    let comparison_index = index::create_index(&config.index.backend, db.clone());

    info!(
        store = %config.database.backend,
        index = %config.index.backend,
        generation = %config.generation.provider,
        signature = %config.signature.provider,
        "Services assembled"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        generator,
        renderer,
        signatures,
        embedder,
        comparison_index,
        config.workflow.clone(),
    ));

    Ok(Services { orchestrator, db })
}
