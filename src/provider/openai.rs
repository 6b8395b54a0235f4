//! OpenAI-compatible hosted API.
//!
//! Uses `POST {base_url}/chat/completions` for text and
//! `POST {base_url}/embeddings` for vectors, authenticated with a bearer key.
//! The key comes from `[providers.openai] api_key` or `OPENAI_API_KEY`.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    chat_messages, http_client, parse_vector, send_json, EmbeddingRequest, EmbeddingResponse,
    HealthStatus, Provider, ProviderError, RetryPolicy, TextRequest, TextResponse,
};
use crate::config::OpenAiConfig;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.base_delay_ms),
            ),
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("OPENAI_API_KEY not set".into()))
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let key = self.api_key()?;
        let request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(key)
            .json(body);
        send_json(request).await
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
        let json = self.post("/embeddings", &body).await?;
        let vectors = parse_embeddings(&json)?;
        if vectors.len() != expected {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                expected,
                vectors.len()
            )));
        }
        let model = json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();
        Ok(vectors
            .into_iter()
            .map(|vector| EmbeddingResponse {
                vector,
                model: model.clone(),
                provider: self.name().to_string(),
            })
            .collect())
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| ProviderError::InvalidResponse("missing embedding".into()))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.chat_model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": chat_messages(request),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = temperature.into();
        }

        let json = self.post("/chat/completions", &body).await?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?;

        Ok(TextResponse {
            text: text.trim().to_string(),
            model: json
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            provider: self.name().to_string(),
            prompt_tokens: json
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            completion_tokens: json
                .pointer("/usage/completion_tokens")
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
        self.api_key.is_some()
    }

    async fn health_check(&self) -> HealthStatus {
        let key = match self.api_key() {
            Ok(key) => key,
            Err(e) => return HealthStatus::unhealthy(self.name(), e.to_string()),
        };
        let request = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(key);
        match send_json(request).await {
            Ok(json) => {
                let models = json
                    .get("data")
                    .and_then(|d| d.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                            .map(|id| id.to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                HealthStatus::healthy(self.name(), models)
            }
            Err(e) => HealthStatus::unhealthy(self.name(), e.to_string()),
        }
    }
}
