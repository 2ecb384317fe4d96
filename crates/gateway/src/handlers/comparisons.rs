//! Comparison query and re-indexing handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use careforge_common::{
    errors::{AppError, Result},
    index::plans,
    index::ScoredRecord,
};

fn default_k() -> usize {
    5
}

#[derive(Deserialize, Validate)]
pub struct CompareRequest {
    /// Free-text query compared against documents and reference plans
    #[validate(length(min = 1))]
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

#[derive(Serialize)]
pub struct CompareResponse {
    pub results: Vec<ScoredRecord>,
}

/// Similarity query over indexed documents and reference insurance plans
pub async fn compare(
    State(state): State<AppState>,
    Json(request): Json<CompareRequest>,
) -> Result<Json<CompareResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("query".into()),
    })?;

    let results = state.orchestrator.compare(&request.query, request.k).await?;
    Ok(Json(CompareResponse { results }))
}

#[derive(Serialize)]
pub struct ReindexResponse {
    pub documents: usize,
    pub reference_plans: usize,
}

/// Rebuild the comparison index from indexed documents and the
/// configured reference plans. Idempotent.
pub async fn reindex(State(state): State<AppState>) -> Result<Json<ReindexResponse>> {
    let documents = state.orchestrator.reindex_documents().await?;

    let reference_plans = match &state.config.index.reference_plans_file {
        Some(path) => {
            let loaded = plans::load_reference_plans(path).await?;
            state.orchestrator.index_reference_plans(&loaded).await?
        }
        None => 0,
    };

    Ok(Json(ReindexResponse {
        documents,
        reference_plans,
    }))
}
