//! Error types for Careforge services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors (1xxx)
    ValidationError,
    TemplateInputError,
    InvalidQueryError,
    UnknownRole,

    // Resource errors (4xxx)
    NotFound,
    DocumentNotFound,
    TemplateNotFound,

    // Concurrency errors (5xxx)
    Conflict,
    ConcurrentUpdateError,
    InvalidTransition,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    GenerationUnavailable,
    RenderError,
    SignatureError,
    IndexError,
    EmbeddingError,
    RetriesExhausted,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Input (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::TemplateInputError => 1002,
            ErrorCode::InvalidQueryError => 1003,
            ErrorCode::UnknownRole => 1004,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::DocumentNotFound => 4002,
            ErrorCode::TemplateNotFound => 4003,

            // Concurrency (5xxx)
            ErrorCode::Conflict => 5001,
            ErrorCode::ConcurrentUpdateError => 5002,
            ErrorCode::InvalidTransition => 5003,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::GenerationUnavailable => 8001,
            ErrorCode::RenderError => 8002,
            ErrorCode::SignatureError => 8003,
            ErrorCode::IndexError => 8004,
            ErrorCode::EmbeddingError => 8005,
            ErrorCode::RetriesExhausted => 8006,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Input errors - caller's fault, never retried
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Template {template_id} is missing required inputs: {missing:?}")]
    TemplateInput {
        template_id: String,
        missing: Vec<String>,
    },

    #[error("Invalid comparison query: {message}")]
    InvalidQuery { message: String },

    #[error("Unknown role: {role}")]
    UnknownRole { role: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("Template not found: {id}")]
    TemplateNotFound { id: String },

    // Concurrency errors - recovered locally, surfaced only when the bound is exceeded
    #[error("Conflicting update to document {id}: expected version {expected}")]
    Conflict { id: String, expected: i32 },

    #[error("Concurrent updates to document {id} exceeded {attempts} attempts")]
    ConcurrentUpdate { id: String, attempts: u32 },

    #[error("Invalid state transition for document {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Generation service unavailable: {message}")]
    GenerationUnavailable { message: String },

    #[error("Render failed for template {template_id}: {message}")]
    Render {
        template_id: String,
        message: String,
    },

    #[error("Signature provider error: {message}")]
    Signature { message: String },

    #[error("Comparison index error: {message}")]
    Index { message: String },

    #[error("Embedding service error: {message}")]
    Embedding { message: String },

    #[error("Retries exhausted after {attempts} attempts (document left in {last_state}): {source}")]
    RetriesExhausted {
        attempts: u32,
        last_state: String,
        #[source]
        source: Box<AppError>,
    },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::TemplateInput { .. } => ErrorCode::TemplateInputError,
            AppError::InvalidQuery { .. } => ErrorCode::InvalidQueryError,
            AppError::UnknownRole { .. } => ErrorCode::UnknownRole,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            AppError::TemplateNotFound { .. } => ErrorCode::TemplateNotFound,
            AppError::Conflict { .. } => ErrorCode::Conflict,
            AppError::ConcurrentUpdate { .. } => ErrorCode::ConcurrentUpdateError,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::GenerationUnavailable { .. } => ErrorCode::GenerationUnavailable,
            AppError::Render { .. } => ErrorCode::RenderError,
            AppError::Signature { .. } => ErrorCode::SignatureError,
            AppError::Index { .. } => ErrorCode::IndexError,
            AppError::Embedding { .. } => ErrorCode::EmbeddingError,
            AppError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::TemplateInput { .. }
            | AppError::InvalidQuery { .. }
            | AppError::UnknownRole { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::NotFound { .. }
            | AppError::DocumentNotFound { .. }
            | AppError::TemplateNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Conflict { .. }
            | AppError::ConcurrentUpdate { .. }
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,

            // 422 Unprocessable Entity
            AppError::Render { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::GenerationUnavailable { .. }
            | AppError::Signature { .. }
            | AppError::Index { .. }
            | AppError::Embedding { .. }
            | AppError::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Check whether the orchestrator may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::GenerationUnavailable { .. }
                | AppError::Signature { .. }
                | AppError::Index { .. }
                | AppError::Embedding { .. }
                | AppError::DatabaseConnection { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details: None,
                request_id: None, // Should be filled by middleware
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ServiceUnavailable {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::DocumentNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::DocumentNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_input_errors_are_client_errors() {
        let err = AppError::TemplateInput {
            template_id: "T1".into(),
            missing: vec!["name".into()],
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = AppError::InvalidQuery {
            message: "k must be a positive integer".into(),
        };
        assert_eq!(err.code(), ErrorCode::InvalidQueryError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::GenerationUnavailable {
            message: "timeout".into()
        }
        .is_retryable());
        assert!(AppError::Signature {
            message: "502 from provider".into()
        }
        .is_retryable());
        assert!(!AppError::Render {
            template_id: "T1".into(),
            message: "bad content".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_retries_exhausted_carries_cause() {
        let err = AppError::RetriesExhausted {
            attempts: 3,
            last_state: "requested".into(),
            source: Box::new(AppError::GenerationUnavailable {
                message: "connection reset".into(),
            }),
        };
        assert_eq!(err.code(), ErrorCode::RetriesExhausted);
        assert!(err.to_string().contains("requested"));
        assert!(err.to_string().contains("3 attempts"));
    }
}
