//! Local Ollama daemon.
//!
//! `POST /api/chat` (non-streaming) for text, `POST /api/embed` for vectors,
//! and `GET /api/tags` for availability and health. Requires the models to be
//! pulled beforehand, e.g. `ollama pull nomic-embed-text`.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    chat_messages, http_client, parse_vector, send_json, EmbeddingRequest, EmbeddingResponse,
    HealthStatus, Provider, ProviderError, RetryPolicy, TextRequest, TextResponse,
};
use crate::config::OllamaConfig;

/// Availability probes must not stall fallback for the full request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct OllamaProvider {
    client: reqwest::Client,
    host: String,
    chat_model: String,
    embedding_model: String,
    retry: RetryPolicy,
}

impl OllamaProvider {
    pub fn new(config: &OllamaConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            host: config.host.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.base_delay_ms),
            ),
        })
    }

    async fn tags(&self, timeout: Option<Duration>) -> Result<Vec<String>, ProviderError> {
        let mut request = self.client.get(format!("{}/api/tags", self.host));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let json = send_json(request).await?;
        Ok(json
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(|n| n.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn embed(
        &self,
        texts: Vec<&str>,
        model: &str,
    ) -> Result<Vec<EmbeddingResponse>, ProviderError> {
        let expected = texts.len();
        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.host))
            .json(&body);
        let json = send_json(request).await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::InvalidResponse("missing embeddings array".into()))?;
        if embeddings.len() != expected {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                expected,
                embeddings.len()
            )));
        }

        embeddings
            .iter()
            .map(|e| -> Result<EmbeddingResponse, ProviderError> {
                Ok(EmbeddingResponse {
                    vector: parse_vector(e)?,
                    model: model.to_string(),
                    provider: self.name().to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.chat_model);
        let mut options = serde_json::Map::new();
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".into(), max_tokens.into());
        }
        if let Some(temperature) = request.temperature {
            options.insert("temperature".into(), temperature.into());
        }
        let body = serde_json::json!({
            "model": model,
            "messages": chat_messages(request),
            "stream": false,
            "options": options,
        });

        let request = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body);
        let json = send_json(request).await?;
        let text = json
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse("missing message.content".into()))?;

        Ok(TextResponse {
            text: text.trim().to_string(),
            model: model.to_string(),
            provider: self.name().to_string(),
            prompt_tokens: json
                .get("prompt_eval_count")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            completion_tokens: json
                .get("eval_count")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
        })
    }

    async fn generate_embedding(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.embedding_model);
        self.embed(vec![request.text.as_str()], model)
            .await?
            .pop()
            .ok_or_else(|| ProviderError::InvalidResponse("no embedding returned".into()))
    }

    async fn batch_generate_embeddings(
        &self,
        requests: &[EmbeddingRequest],
    ) -> Result<Vec<EmbeddingResponse>, ProviderError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let model = requests[0]
            .model
            .as_deref()
            .unwrap_or(&self.embedding_model);
        let texts = requests.iter().map(|r| r.text.as_str()).collect();
        self.embed(texts, model).await
    }

    async fn is_available(&self) -> bool {
        self.tags(Some(PROBE_TIMEOUT)).await.is_ok()
    }

    async fn health_check(&self) -> HealthStatus {
        match self.tags(None).await {
            Ok(models) => HealthStatus::healthy(self.name(), models),
            Err(e) => HealthStatus::unhealthy(self.name(), e.to_string()),
        }
    }
}
