//! Generation service abstraction
//!
//! Wraps the text-generation capability behind a role-aware template
//! contract. The adapter validates template inputs before calling out,
//! and wraps every transport failure as `GenerationUnavailable`; retry
//! policy belongs to the orchestrator, not the adapter.

pub mod templates;

pub use templates::DocumentTemplate;

use crate::config::GenerationConfig;
use crate::db::models::Role;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trait for contract text generation
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate document content for a role/template pair
    async fn generate(
        &self,
        role: Role,
        template_id: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<String>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Cohere chat client
pub struct CohereGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
    base_url: String,
}

#[derive(Serialize)]
struct CohereChatRequest {
    model: String,
    message: String,
    temperature: f32,
}

#[derive(Deserialize)]
struct CohereChatResponse {
    text: String,
}

impl CohereGenerator {
    /// Create a new Cohere generation client
    pub fn new(config: &GenerationConfig, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.cohere.com".to_string()),
        }
    }

    async fn chat(&self, message: String) -> Result<String> {
        let url = format!("{}/v1/chat", self.base_url);

        let request = CohereChatRequest {
            model: self.model.clone(),
            message,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::GenerationUnavailable {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationUnavailable {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: CohereChatResponse =
            response
                .json()
                .await
                .map_err(|e| AppError::GenerationUnavailable {
                    message: format!("Failed to parse response: {}", e),
                })?;

        Ok(result.text)
    }
}

#[async_trait]
impl Generator for CohereGenerator {
    async fn generate(
        &self,
        role: Role,
        template_id: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<String> {
        let template = templates::get(template_id)?;
        let prompt = template.build_prompt(role, inputs)?;

        let text = self.chat(prompt).await?;
        let content = clean_model_output(&text);
        if content.is_empty() {
            return Err(AppError::GenerationUnavailable {
                message: "Model returned empty content".to_string(),
            });
        }
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Strip markdown code fences and stray non-breaking spaces from model
/// output, leaving the inner content.
pub fn clean_model_output(text: &str) -> String {
    let fence = Regex::new(r"(?s)```(?:json)?\n?(.*?)```").expect("static regex");
    let cleaned = fence.replace_all(text, "$1");
    cleaned.replace('\u{a0}', " ").trim().to_string()
}

/// Mock generator for testing
pub struct MockGenerator {
    content: String,
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl MockGenerator {
    pub fn new(content: &str) -> Self {
        Self::failing_times(content, 0)
    }

    /// Fail with `GenerationUnavailable` the first `failures` calls,
    /// then succeed
    pub fn failing_times(content: &str, failures: u32) -> Self {
        Self {
            content: content.to_string(),
            remaining_failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail every call
    pub fn always_failing() -> Self {
        Self::failing_times("", u32::MAX)
    }

    /// Number of times the external call was attempted
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        role: Role,
        template_id: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<String> {
        let template = templates::get(template_id)?;
        template.build_prompt(role, inputs)?;

        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures
                .store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Err(AppError::GenerationUnavailable {
                message: "mock generation failure".to_string(),
            });
        }

        Ok(self.content.clone())
    }

    fn model_name(&self) -> &str {
        "mock-generation"
    }
}

/// Create a generator based on configuration
pub fn create_generator(config: &GenerationConfig) -> Arc<dyn Generator> {
    match config.provider.as_str() {
        "cohere" => {
            let key = config.api_key.clone().expect("Cohere API key required");
            Arc::new(CohereGenerator::new(config, key))
        }
        "mock" => Arc::new(MockGenerator::new("{\"patient_information\": {}}")),
        _ => {
            tracing::warn!(provider = %config.provider, "Unknown generation provider, using mock");
            Arc::new(MockGenerator::new("{\"patient_information\": {}}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_mock_generator_returns_content() {
        let gen = MockGenerator::new("{\"ok\": true}");
        let content = gen
            .generate(
                Role::Patient,
                "patient_consent",
                &inputs(&[("name", "Jane Doe")]),
            )
            .await
            .unwrap();
        assert_eq!(content, "{\"ok\": true}");
        assert_eq!(gen.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_before_external_call() {
        let gen = MockGenerator::new("unused");
        let err = gen
            .generate(Role::Patient, "patient_consent", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TemplateInput { .. }));
        assert_eq!(gen.calls(), 0, "external call made despite bad inputs");
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let gen = MockGenerator::failing_times("recovered", 2);
        let args = inputs(&[("name", "Jane Doe")]);

        for _ in 0..2 {
            let err = gen
                .generate(Role::Patient, "patient_consent", &args)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::GenerationUnavailable { .. }));
        }
        let content = gen
            .generate(Role::Patient, "patient_consent", &args)
            .await
            .unwrap();
        assert_eq!(content, "recovered");
        assert_eq!(gen.calls(), 3);
    }

    #[test]
    fn test_clean_model_output_strips_fences() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(clean_model_output(raw), "{\"a\": 1}");

        let plain = "no fences here";
        assert_eq!(clean_model_output(plain), "no fences here");

        let nbsp = "text\u{a0}with nbsp";
        assert_eq!(clean_model_output(nbsp), "text with nbsp");
    }
}
