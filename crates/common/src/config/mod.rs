//! Configuration management for Careforge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Generation (LLM) service configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// PDF render configuration
    #[serde(default)]
    pub render: RenderConfig,

    /// Signature provider configuration
    #[serde(default)]
    pub signature: SignatureConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Comparison index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Workflow orchestrator configuration
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Store backend: memory, postgres
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database URL (postgres backend)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Generation provider: cohere, mock
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    /// API key for the generation service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Directory where rendered PDF artifacts are written
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    /// Page width in PDF points
    #[serde(default = "default_page_width")]
    pub page_width: f32,

    /// Page height in PDF points
    #[serde(default = "default_page_height")]
    pub page_height: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatureConfig {
    /// Signature provider: docusign, mock
    #[serde(default = "default_signature_provider")]
    pub provider: String,

    /// OAuth client (integration key) id
    pub client_id: Option<String>,

    /// Impersonated user id for the JWT grant
    pub impersonated_user_id: Option<String>,

    /// Path to the RSA private key used for the JWT grant
    pub private_key_file: Option<String>,

    /// OAuth authorization server
    #[serde(default = "default_auth_server")]
    pub auth_server: String,

    /// REST API base path
    #[serde(default = "default_signature_base_path")]
    pub base_path: String,

    /// Account id; discovered from userinfo when unset
    pub account_id: Option<String>,

    /// Return URL for embedded signing
    #[serde(default = "default_return_url")]
    pub return_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_signature_timeout")]
    pub timeout_secs: u64,

    /// Token lifetime requested in the JWT grant, in seconds
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,

    /// Default signer name when the request carries none
    pub default_signer_name: Option<String>,

    /// Default signer email when the request carries none
    pub default_signer_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: cohere, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for the embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Index backend: memory, pgvector
    #[serde(default = "default_index_backend")]
    pub backend: String,

    /// JSON file with reference insurance plans
    pub reference_plans_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Maximum generation attempts before the document fails
    #[serde(default = "default_generation_attempts")]
    pub generation_max_attempts: u32,

    /// Maximum envelope-creation attempts before the document fails
    #[serde(default = "default_send_attempts")]
    pub send_max_attempts: u32,

    /// Maximum index-upsert attempts before the document fails
    #[serde(default = "default_index_attempts")]
    pub index_max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Backoff delay cap in milliseconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Bounded retries of an optimistic read-modify-write on conflict
    #[serde(default = "default_conflict_attempts")]
    pub conflict_max_attempts: u32,

    /// Status sweep interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum concurrent status polls during a sweep
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_store_backend() -> String { "memory".to_string() }
fn default_database_url() -> String { "postgres://localhost/careforge".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_generation_provider() -> String { "cohere".to_string() }
fn default_generation_model() -> String { "command-r-plus".to_string() }
fn default_temperature() -> f32 { 0.3 }
fn default_generation_timeout() -> u64 { 60 }
fn default_artifact_dir() -> String { "data/artifacts".to_string() }
fn default_page_width() -> f32 { 612.0 }
fn default_page_height() -> f32 { 792.0 }
fn default_signature_provider() -> String { "docusign".to_string() }
fn default_auth_server() -> String { "account-d.docusign.com".to_string() }
fn default_signature_base_path() -> String { "https://demo.docusign.net/restapi".to_string() }
fn default_return_url() -> String { "http://localhost:8080/ds/callback".to_string() }
fn default_signature_timeout() -> u64 { 30 }
fn default_token_lifetime() -> u64 { 3600 }
fn default_embedding_provider() -> String { "cohere".to_string() }
fn default_embedding_model() -> String { "embed-english-v3.0".to_string() }
fn default_embedding_dimension() -> usize { 1024 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_index_backend() -> String { "memory".to_string() }
fn default_generation_attempts() -> u32 { 3 }
fn default_send_attempts() -> u32 { 3 }
fn default_index_attempts() -> u32 { 3 }
fn default_backoff_base() -> u64 { 100 }
fn default_backoff_cap() -> u64 { 5_000 }
fn default_conflict_attempts() -> u32 { 3 }
fn default_poll_interval() -> u64 { 30 }
fn default_poll_concurrency() -> usize { 8 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "careforge".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl WorkflowConfig {
    /// Get the status sweep interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            generation: GenerationConfig::default(),
            render: RenderConfig::default(),
            signature: SignatureConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            workflow: WorkflowConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            api_key: None,
            api_base: None,
            model: default_generation_model(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            page_width: default_page_width(),
            page_height: default_page_height(),
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            provider: default_signature_provider(),
            client_id: None,
            impersonated_user_id: None,
            private_key_file: None,
            auth_server: default_auth_server(),
            base_path: default_signature_base_path(),
            account_id: None,
            return_url: default_return_url(),
            timeout_secs: default_signature_timeout(),
            token_lifetime_secs: default_token_lifetime(),
            default_signer_name: None,
            default_signer_email: None,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            reference_plans_file: None,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            generation_max_attempts: default_generation_attempts(),
            send_max_attempts: default_send_attempts(),
            index_max_attempts: default_index_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            conflict_max_attempts: default_conflict_attempts(),
            poll_interval_secs: default_poll_interval(),
            poll_concurrency: default_poll_concurrency(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.generation.model, "command-r-plus");
        assert_eq!(config.embedding.model, "embed-english-v3.0");
        assert_eq!(config.embedding.dimension, 1024);
    }

    #[test]
    fn test_workflow_defaults_are_bounded() {
        let config = WorkflowConfig::default();
        assert!(config.generation_max_attempts >= 1);
        assert!(config.conflict_max_attempts >= 1);
        assert!(config.backoff_base_ms <= config.backoff_cap_ms);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }
}
