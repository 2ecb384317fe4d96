//! Signature provider abstraction
//!
//! Wraps envelope creation, embedded signing URL issuance, and status
//! retrieval. Credential state (JWT grant, token refresh) lives behind
//! this adapter's own synchronized cache; the orchestrator never sees
//! it. A declined or voided envelope is a business outcome carried in
//! the status, not an error.

use crate::config::SignatureConfig;
use crate::db::models::Document;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A signer participating in an envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signer {
    pub name: String,
    pub email: String,
    /// Marks the recipient for embedded signing
    pub client_user_id: String,
}

impl Signer {
    pub fn new(name: &str, email: &str, client_user_id: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            client_user_id: client_user_id.to_string(),
        }
    }
}

/// Envelope status reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Created,
    Sent,
    Delivered,
    Signed,
    Declined,
    Voided,
}

impl EnvelopeStatus {
    /// Parse a provider status string. DocuSign reports a fully signed
    /// envelope as "completed".
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(EnvelopeStatus::Created),
            "sent" => Ok(EnvelopeStatus::Sent),
            "delivered" => Ok(EnvelopeStatus::Delivered),
            "signed" | "completed" => Ok(EnvelopeStatus::Signed),
            "declined" => Ok(EnvelopeStatus::Declined),
            "voided" => Ok(EnvelopeStatus::Voided),
            other => Err(AppError::Signature {
                message: format!("Unknown envelope status: {}", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Created => "created",
            EnvelopeStatus::Sent => "sent",
            EnvelopeStatus::Delivered => "delivered",
            EnvelopeStatus::Signed => "signed",
            EnvelopeStatus::Declined => "declined",
            EnvelopeStatus::Voided => "voided",
        }
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for envelope lifecycle operations
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    /// Create an envelope for the document's rendered artifact and
    /// return the provider's envelope id
    async fn create_envelope(&self, document: &Document, signers: &[Signer]) -> Result<String>;

    /// Issue a single-use embedded signing URL for one signer
    async fn signing_url(&self, envelope_id: &str, signer: &Signer) -> Result<String>;

    /// Fetch the envelope's current status
    async fn envelope_status(&self, envelope_id: &str) -> Result<EnvelopeStatus>;
}

/// Cached OAuth token
struct CachedToken {
    access_token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// DocuSign eSignature client using the JWT grant
pub struct DocusignProvider {
    client: reqwest::Client,
    config: SignatureConfig,
    token: Mutex<Option<CachedToken>>,
    account_id: Mutex<Option<String>>,
}

#[derive(Serialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
    scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfoAccount {
    account_id: String,
    #[serde(default)]
    is_default: bool,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    accounts: Vec<UserInfoAccount>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeDocument {
    document_base64: String,
    name: String,
    file_extension: String,
    document_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeSigner {
    email: String,
    name: String,
    recipient_id: String,
    routing_order: String,
    client_user_id: String,
}

#[derive(Serialize)]
struct EnvelopeRecipients {
    signers: Vec<EnvelopeSigner>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeDefinition {
    email_subject: String,
    documents: Vec<EnvelopeDocument>,
    recipients: EnvelopeRecipients,
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeCreateResponse {
    envelope_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecipientViewRequest {
    authentication_method: String,
    client_user_id: String,
    return_url: String,
    user_name: String,
    email: String,
}

#[derive(Deserialize)]
struct RecipientViewResponse {
    url: String,
}

#[derive(Deserialize)]
struct EnvelopeStatusResponse {
    status: String,
}

impl DocusignProvider {
    pub fn new(config: SignatureConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            config,
            token: Mutex::new(None),
            account_id: Mutex::new(None),
        }
    }

    fn require(value: &Option<String>, name: &str) -> Result<String> {
        value.clone().ok_or_else(|| AppError::Configuration {
            message: format!("signature.{} is required for the DocuSign provider", name),
        })
    }

    /// Build and sign the JWT grant assertion
    async fn build_assertion(&self) -> Result<String> {
        let client_id = Self::require(&self.config.client_id, "client_id")?;
        let user_id = Self::require(&self.config.impersonated_user_id, "impersonated_user_id")?;
        let key_file = Self::require(&self.config.private_key_file, "private_key_file")?;

        let pem = tokio::fs::read(&key_file)
            .await
            .map_err(|e| AppError::Configuration {
                message: format!("Cannot read private key {}: {}", key_file, e),
            })?;
        let key = EncodingKey::from_rsa_pem(&pem).map_err(|e| AppError::Configuration {
            message: format!("Invalid RSA private key: {}", e),
        })?;

        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: client_id,
            sub: user_id,
            aud: self.config.auth_server.clone(),
            iat: now,
            exp: now + self.config.token_lifetime_secs as i64,
            scope: "signature impersonation".to_string(),
        };

        encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| AppError::Signature {
            message: format!("JWT assertion failed: {}", e),
        })
    }

    /// Get a valid access token, refreshing through the JWT grant when
    /// the cached one is missing or near expiry. The cache is held
    /// behind this mutex so concurrent workflows share one refresh.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(60) > chrono::Utc::now() {
                return Ok(token.access_token.clone());
            }
        }

        let assertion = self.build_assertion().await?;
        let url = format!("https://{}/oauth/token", self.config.auth_server);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::Signature {
                message: format!("Token request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Signature {
                message: format!("Token request error {}: {}", status, body),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| AppError::Signature {
            message: format!("Failed to parse token response: {}", e),
        })?;

        info!("Refreshed signature provider access token");

        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(token.expires_in),
        });

        Ok(access_token)
    }

    /// Resolve the account id from config or the userinfo endpoint
    async fn resolve_account_id(&self, access_token: &str) -> Result<String> {
        if let Some(ref id) = self.config.account_id {
            return Ok(id.clone());
        }

        let mut cached = self.account_id.lock().await;
        if let Some(ref id) = *cached {
            return Ok(id.clone());
        }

        let url = format!("https://{}/oauth/userinfo", self.config.auth_server);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::Signature {
                message: format!("Userinfo request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(AppError::Signature {
                message: format!("Userinfo error {}", response.status()),
            });
        }

        let info: UserInfoResponse = response.json().await.map_err(|e| AppError::Signature {
            message: format!("Failed to parse userinfo: {}", e),
        })?;

        let account = info
            .accounts
            .iter()
            .find(|a| a.is_default)
            .or_else(|| info.accounts.first())
            .ok_or_else(|| AppError::Signature {
                message: "Userinfo returned no accounts".to_string(),
            })?;

        *cached = Some(account.account_id.clone());
        Ok(account.account_id.clone())
    }
}

#[async_trait]
impl SignatureProvider for DocusignProvider {
    async fn create_envelope(&self, document: &Document, signers: &[Signer]) -> Result<String> {
        let blob_ref = document
            .rendered_blob_ref
            .as_deref()
            .ok_or_else(|| AppError::Signature {
                message: format!("Document {} has no rendered artifact", document.id),
            })?;

        let pdf = tokio::fs::read(blob_ref).await.map_err(|e| AppError::Signature {
            message: format!("Cannot read rendered artifact {}: {}", blob_ref, e),
        })?;

        let token = self.access_token().await?;
        let account_id = self.resolve_account_id(&token).await?;

        let definition = EnvelopeDefinition {
            email_subject: format!("Please sign: {}", document.template_id),
            documents: vec![EnvelopeDocument {
                document_base64: BASE64.encode(&pdf),
                name: format!("{}.pdf", document.id),
                file_extension: "pdf".to_string(),
                document_id: "1".to_string(),
            }],
            recipients: EnvelopeRecipients {
                signers: signers
                    .iter()
                    .enumerate()
                    .map(|(i, s)| EnvelopeSigner {
                        email: s.email.clone(),
                        name: s.name.clone(),
                        recipient_id: (i + 1).to_string(),
                        routing_order: (i + 1).to_string(),
                        client_user_id: s.client_user_id.clone(),
                    })
                    .collect(),
            },
            status: "sent".to_string(),
        };

        let url = format!(
            "{}/v2.1/accounts/{}/envelopes",
            self.config.base_path, account_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&definition)
            .send()
            .await
            .map_err(|e| AppError::Signature {
                message: format!("Envelope creation failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Signature {
                message: format!("Envelope creation error {}: {}", status, body),
            });
        }

        let created: EnvelopeCreateResponse =
            response.json().await.map_err(|e| AppError::Signature {
                message: format!("Failed to parse envelope response: {}", e),
            })?;

        debug!(envelope_id = %created.envelope_id, document_id = %document.id, "Envelope created");
        Ok(created.envelope_id)
    }

    async fn signing_url(&self, envelope_id: &str, signer: &Signer) -> Result<String> {
        let token = self.access_token().await?;
        let account_id = self.resolve_account_id(&token).await?;

        let request = RecipientViewRequest {
            authentication_method: "none".to_string(),
            client_user_id: signer.client_user_id.clone(),
            return_url: self.config.return_url.clone(),
            user_name: signer.name.clone(),
            email: signer.email.clone(),
        };

        let url = format!(
            "{}/v2.1/accounts/{}/envelopes/{}/views/recipient",
            self.config.base_path, account_id, envelope_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Signature {
                message: format!("Recipient view request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Signature {
                message: format!("Recipient view error {}: {}", status, body),
            });
        }

        let view: RecipientViewResponse =
            response.json().await.map_err(|e| AppError::Signature {
                message: format!("Failed to parse recipient view: {}", e),
            })?;

        Ok(view.url)
    }

    async fn envelope_status(&self, envelope_id: &str) -> Result<EnvelopeStatus> {
        let token = self.access_token().await?;
        let account_id = self.resolve_account_id(&token).await?;

        let url = format!(
            "{}/v2.1/accounts/{}/envelopes/{}",
            self.config.base_path, account_id, envelope_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| AppError::Signature {
                message: format!("Status request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(AppError::Signature {
                message: format!("Status request error {}", response.status()),
            });
        }

        let status: EnvelopeStatusResponse =
            response.json().await.map_err(|e| AppError::Signature {
                message: format!("Failed to parse status response: {}", e),
            })?;

        EnvelopeStatus::parse(&status.status)
    }
}

/// Mock provider replaying a programmable status sequence
pub struct MockSignatureProvider {
    statuses: Mutex<Vec<EnvelopeStatus>>,
    fail_creates: AtomicU32,
    envelopes: AtomicU32,
    status_calls: AtomicU32,
}

impl MockSignatureProvider {
    /// Polls replay `statuses` in order, repeating the last entry once
    /// the sequence is exhausted
    pub fn with_statuses(statuses: Vec<EnvelopeStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses),
            fail_creates: AtomicU32::new(0),
            envelopes: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` envelope creations with a transient error
    pub fn failing_creates(mut self, n: u32) -> Self {
        *self.fail_creates.get_mut() = n;
        self
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignatureProvider for MockSignatureProvider {
    async fn create_envelope(&self, document: &Document, _signers: &[Signer]) -> Result<String> {
        if document.rendered_blob_ref.is_none() {
            return Err(AppError::Signature {
                message: format!("Document {} has no rendered artifact", document.id),
            });
        }
        let remaining = self.fail_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Signature {
                message: "mock envelope creation failure".to_string(),
            });
        }
        let n = self.envelopes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("E{}", n))
    }

    async fn signing_url(&self, envelope_id: &str, signer: &Signer) -> Result<String> {
        Ok(format!(
            "https://sign.example.test/{}/{}?once={}",
            envelope_id,
            signer.client_user_id,
            uuid::Uuid::new_v4()
        ))
    }

    async fn envelope_status(&self, _envelope_id: &str) -> Result<EnvelopeStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().await;
        if statuses.len() > 1 {
            Ok(statuses.remove(0))
        } else {
            statuses.first().copied().ok_or_else(|| AppError::Signature {
                message: "mock status sequence empty".to_string(),
            })
        }
    }
}

/// Create a signature provider based on configuration
pub fn create_signature_provider(config: &SignatureConfig) -> Arc<dyn SignatureProvider> {
    match config.provider.as_str() {
        "docusign" => Arc::new(DocusignProvider::new(config.clone())),
        "mock" => Arc::new(MockSignatureProvider::with_statuses(vec![
            EnvelopeStatus::Sent,
        ])),
        other => {
            tracing::warn!(provider = other, "Unknown signature provider, using mock");
            Arc::new(MockSignatureProvider::with_statuses(vec![
                EnvelopeStatus::Sent,
            ]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Document, Role};

    fn rendered_doc() -> Document {
        let mut doc = Document::new(Role::Patient, "patient_consent", serde_json::json!({}));
        doc.rendered_blob_ref = Some("blob:mock/abc".into());
        doc
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            EnvelopeStatus::parse("signed").unwrap(),
            EnvelopeStatus::Signed
        );
        // DocuSign reports fully signed envelopes as completed
        assert_eq!(
            EnvelopeStatus::parse("Completed").unwrap(),
            EnvelopeStatus::Signed
        );
        assert_eq!(
            EnvelopeStatus::parse("VOIDED").unwrap(),
            EnvelopeStatus::Voided
        );
        assert!(EnvelopeStatus::parse("shredded").is_err());
    }

    #[tokio::test]
    async fn test_mock_envelope_ids_are_sequential() {
        let provider = MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Sent]);
        let doc = rendered_doc();
        let signers = [Signer::new("Jane Doe", "jane@example.test", "1000")];
        assert_eq!(provider.create_envelope(&doc, &signers).await.unwrap(), "E1");
        assert_eq!(provider.create_envelope(&doc, &signers).await.unwrap(), "E2");
    }

    #[tokio::test]
    async fn test_mock_replays_status_sequence() {
        let provider = MockSignatureProvider::with_statuses(vec![
            EnvelopeStatus::Sent,
            EnvelopeStatus::Delivered,
            EnvelopeStatus::Signed,
        ]);
        assert_eq!(
            provider.envelope_status("E1").await.unwrap(),
            EnvelopeStatus::Sent
        );
        assert_eq!(
            provider.envelope_status("E1").await.unwrap(),
            EnvelopeStatus::Delivered
        );
        // Last status repeats for duplicate polls
        assert_eq!(
            provider.envelope_status("E1").await.unwrap(),
            EnvelopeStatus::Signed
        );
        assert_eq!(
            provider.envelope_status("E1").await.unwrap(),
            EnvelopeStatus::Signed
        );
    }

    #[tokio::test]
    async fn test_create_envelope_requires_rendered_artifact() {
        let provider = MockSignatureProvider::with_statuses(vec![EnvelopeStatus::Sent]);
        let doc = Document::new(Role::Patient, "patient_consent", serde_json::json!({}));
        let err = provider
            .create_envelope(&doc, &[Signer::new("J", "j@example.test", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Signature { .. }));
    }

    #[test]
    fn test_jwt_claims_shape() {
        let claims = JwtClaims {
            iss: "client".into(),
            sub: "user".into(),
            aud: "account-d.docusign.com".into(),
            iat: 1,
            exp: 3601,
            scope: "signature impersonation".into(),
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["aud"], "account-d.docusign.com");
        assert_eq!(value["scope"], "signature impersonation");
    }
}
