//! Document workflow handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use careforge_common::{
    db::models::{Document, DocumentState, Role},
    db::DocumentFilter,
    errors::{AppError, Result},
    signature::{EnvelopeStatus, Signer},
    workflow::CreateDocument,
};

/// Document creation request
#[derive(Deserialize, Validate)]
pub struct CreateDocumentRequest {
    pub role: String,
    pub template_id: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    #[validate(nested)]
    pub signers: Vec<SignerPayload>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Deserialize, Validate)]
pub struct SignerPayload {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(email)]
    pub email: String,
}

/// Document lifecycle response
#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub role: String,
    pub template_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_blob_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Document> for DocumentResponse {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            role: doc.role,
            template_id: doc.template_id,
            state: doc.state,
            envelope_id: doc.envelope_id,
            rendered_blob_ref: doc.rendered_blob_ref,
            error_message: doc.error_message,
            created_at: doc.created_at.to_rfc3339(),
            updated_at: doc.updated_at.to_rfc3339(),
        }
    }
}

/// Create a document and drive it toward the signature provider in the
/// background
pub async fn create_document(
    State(state): State<AppState>,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let role = Role::try_from(request.role.as_str())?;
    let signers = resolve_signers(&state, request.signers)?;

    let doc = state
        .orchestrator
        .create(CreateDocument {
            role,
            template_id: request.template_id,
            inputs: request.inputs,
            signers,
            metadata: request.metadata,
        })
        .await?;

    // Generation and envelope creation are long-latency; the caller
    // tracks progress through the state endpoint.
    let orchestrator = state.orchestrator.clone();
    let id = doc.id;
    tokio::spawn(async move {
        if let Err(e) = orchestrator.advance(id).await {
            tracing::error!(document_id = %id, error = %e, "Workflow advance failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(doc.into())))
}

fn resolve_signers(state: &AppState, payload: Vec<SignerPayload>) -> Result<Vec<Signer>> {
    if !payload.is_empty() {
        return Ok(payload
            .into_iter()
            .map(|s| {
                let client_user_id = Uuid::new_v4().to_string();
                Signer::new(&s.name, &s.email, &client_user_id)
            })
            .collect());
    }

    // Fall back to the configured default signer
    let signature = &state.config.signature;
    match (&signature.default_signer_name, &signature.default_signer_email) {
        (Some(name), Some(email)) => {
            Ok(vec![Signer::new(name, email, &Uuid::new_v4().to_string())])
        }
        _ => Err(AppError::Validation {
            message: "Request has no signers and no default signer is configured".into(),
            field: Some("signers".into()),
        }),
    }
}

/// Get a document's lifecycle state
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentResponse>> {
    let doc = state.orchestrator.store().get(id).await?;
    Ok(Json(doc.into()))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub limit: Option<u64>,
}

/// List documents, optionally filtered by lifecycle state
pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DocumentResponse>>> {
    let filter = DocumentFilter {
        state: query
            .state
            .as_deref()
            .map(DocumentState::try_from)
            .transpose()
            .map_err(|_| AppError::Validation {
                message: format!(
                    "Unknown state filter: {}",
                    query.state.as_deref().unwrap_or_default()
                ),
                field: Some("state".into()),
            })?,
        role: None,
        limit: query.limit,
    };

    let docs = state.orchestrator.store().list(filter).await?;
    Ok(Json(docs.into_iter().map(Into::into).collect()))
}

#[derive(Deserialize)]
pub struct SigningUrlQuery {
    pub signer: Option<String>,
}

#[derive(Serialize)]
pub struct SigningUrlResponse {
    pub document_id: Uuid,
    /// Single-use, time-limited embedded signing URL
    pub url: String,
}

/// Issue an embedded signing URL for a sent document
pub async fn signing_url(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SigningUrlQuery>,
) -> Result<Json<SigningUrlResponse>> {
    let url = state
        .orchestrator
        .signing_url(id, query.signer.as_deref())
        .await?;
    Ok(Json(SigningUrlResponse {
        document_id: id,
        url,
    }))
}

#[derive(Deserialize)]
pub struct StatusCallback {
    pub status: String,
}

/// Apply an envelope status event (provider callback or manual poll
/// trigger). Duplicate and stale events are no-ops.
pub async fn apply_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(callback): Json<StatusCallback>,
) -> Result<Json<DocumentResponse>> {
    let status = EnvelopeStatus::parse(&callback.status)?;
    let doc = state.orchestrator.reconcile(id, status).await?;
    Ok(Json(doc.into()))
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

/// Administratively fail a non-terminal document
pub async fn fail_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<FailRequest>,
) -> Result<Json<DocumentResponse>> {
    let doc = state.orchestrator.fail(id, &request.reason).await?;
    Ok(Json(doc.into()))
}
