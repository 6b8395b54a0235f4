//! Text-generation and embedding backends.
//!
//! Every backend implements the [`Provider`] trait. Concrete providers are
//! independent structs ([`OpenAiProvider`], [`OllamaProvider`]); the pieces
//! they share (HTTP status classification, vector parsing, client setup) are
//! free functions in this module.
//!
//! Providers never retry on their own. The [`ProviderManager`] wraps every
//! call in the provider's [`RetryPolicy`] and walks the fallback order when a
//! provider is unavailable or keeps failing.
//!
//! # Error classification
//!
//! | Condition | Error | Retried |
//! |-----------|-------|---------|
//! | request timeout | [`ProviderError::Timeout`] | yes |
//! | connect/transport failure | [`ProviderError::Connection`] | yes |
//! | HTTP 429 | [`ProviderError::RateLimited`] | yes |
//! | HTTP 5xx | [`ProviderError::Server`] | yes |
//! | HTTP 401/403 | [`ProviderError::Auth`] | no |
//! | HTTP 404 | [`ProviderError::InvalidModel`] | no |
//! | other 4xx | [`ProviderError::Client`] | no |
//! | malformed body | [`ProviderError::InvalidResponse`] | no |

mod manager;
mod ollama;
mod openai;
mod retry;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub use manager::{BatchEmbeddings, GroupFailure, ProviderInfo, ProviderManager};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::Connection(_)
                | ProviderError::RateLimited(_)
                | ProviderError::Server { .. }
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TextRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Provider default when `None`.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextResponse {
    pub text: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingRequest {
    pub text: String,
    pub model: Option<String>,
}

impl EmbeddingRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub provider: String,
    pub healthy: bool,
    pub detail: Option<String>,
    pub models: Vec<String>,
}

impl HealthStatus {
    pub fn healthy(provider: &str, models: Vec<String>) -> Self {
        Self {
            provider: provider.to_string(),
            healthy: true,
            detail: None,
            models,
        }
    }

    pub fn unhealthy(provider: &str, detail: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            healthy: false,
            detail: Some(detail.into()),
            models: Vec::new(),
        }
    }
}

/// A text-generation and embedding backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable name used in configuration and stored with embeddings.
    fn name(&self) -> &str;

    fn retry_policy(&self) -> RetryPolicy;

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError>;

    async fn generate_embedding(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError>;

    /// One response per request, in request order.
    async fn batch_generate_embeddings(
        &self,
        requests: &[EmbeddingRequest],
    ) -> Result<Vec<EmbeddingResponse>, ProviderError>;

    /// Cheap check used to skip a provider during fallback.
    async fn is_available(&self) -> bool;

    async fn health_check(&self) -> HealthStatus;
}

/// Map a non-success HTTP status to a [`ProviderError`].
pub fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited(body),
        401 | 403 => ProviderError::Auth(body),
        404 => ProviderError::InvalidModel(body),
        500..=599 => ProviderError::Server {
            status,
            message: body,
        },
        _ => ProviderError::Client {
            status,
            message: body,
        },
    }
}

/// Map a reqwest transport error to a [`ProviderError`].
pub fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_decode() {
        ProviderError::InvalidResponse(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| ProviderError::Connection(format!("failed to build HTTP client: {}", e)))
}

/// Send a prepared request and decode a JSON body, classifying failures.
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), body));
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

/// Parse a JSON array of numbers into an `f32` vector.
pub(crate) fn parse_vector(value: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let array = value
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("embedding is not an array".into()))?;
    if array.is_empty() {
        return Err(ProviderError::InvalidResponse("empty embedding".into()));
    }
    array
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::InvalidResponse("non-numeric embedding value".into()))
        })
        .collect()
}

/// Chat messages in the shape both hosted and local chat APIs accept.
pub(crate) fn chat_messages(request: &TextRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(serde_json::json!({ "role": "system", "content": system }));
    }
    messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));
    messages
}
