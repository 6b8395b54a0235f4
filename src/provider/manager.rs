use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    EmbeddingRequest, EmbeddingResponse, HealthStatus, OllamaProvider, OpenAiProvider, Provider,
    ProviderError, TextRequest, TextResponse,
};
use crate::config::ProvidersConfig;

/// Registered providers with a primary and ordered fallbacks.
pub struct ProviderManager {
    providers: Vec<Arc<dyn Provider>>,
    primary: Option<usize>,
    embedding_batch_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub primary: bool,
    pub available: bool,
}

/// A batch-embedding group that failed on every candidate.
#[derive(Debug, Clone)]
pub struct GroupFailure {
    /// Index of the first request in the group.
    pub offset: usize,
    pub len: usize,
    pub error: ProviderError,
}

/// Per-input results of [`ProviderManager::batch_embed`].
#[derive(Debug, Default)]
pub struct BatchEmbeddings {
    /// Aligned with the input; `None` where the input's group failed.
    pub results: Vec<Option<EmbeddingResponse>>,
    pub failures: Vec<GroupFailure>,
}

impl BatchEmbeddings {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }
}

impl ProviderManager {
    pub fn new(embedding_batch_size: usize) -> Self {
        Self {
            providers: Vec::new(),
            primary: None,
            embedding_batch_size: embedding_batch_size.max(1),
        }
    }

    /// Build the providers named in `[providers]`, primary first.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut manager = Self::new(config.embedding_batch_size);
        for (i, name) in config.ordered_names().iter().enumerate() {
            let provider: Arc<dyn Provider> = match name.as_str() {
                "openai" => Arc::new(OpenAiProvider::new(&config.openai)?),
                "ollama" => Arc::new(OllamaProvider::new(&config.ollama)?),
                other => anyhow::bail!("Unknown provider: '{}'", other),
            };
            manager.register(provider, i == 0);
        }
        Ok(manager)
    }

    /// Register a provider. The first registration becomes primary unless a
    /// later one asks for it explicitly.
    pub fn register(&mut self, provider: Arc<dyn Provider>, primary: bool) {
        let index = self.providers.len();
        debug!(provider = provider.name(), primary, "registered provider");
        self.providers.push(provider);
        if primary || self.primary.is_none() {
            self.primary = Some(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn primary_name(&self) -> Option<&str> {
        self.primary.map(|i| self.providers[i].name())
    }

    /// Candidate order: preferred, primary, then the rest in registration
    /// order. Availability is checked later, per call.
    fn candidates(&self, preferred: Option<&str>) -> Vec<Arc<dyn Provider>> {
        let mut order: Vec<usize> = Vec::with_capacity(self.providers.len());
        if let Some(name) = preferred {
            if let Some(i) = self.providers.iter().position(|p| p.name() == name) {
                order.push(i);
            }
        }
        if let Some(i) = self.primary {
            if !order.contains(&i) {
                order.push(i);
            }
        }
        for i in 0..self.providers.len() {
            if !order.contains(&i) {
                order.push(i);
            }
        }
        order.into_iter().map(|i| self.providers[i].clone()).collect()
    }

    async fn with_fallback<T, F, Fut>(
        &self,
        preferred: Option<&str>,
        operation: &str,
        op: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_err = None;
        for provider in self.candidates(preferred) {
            if !provider.is_available().await {
                debug!(provider = provider.name(), operation, "skipping unavailable provider");
                continue;
            }
            let policy = provider.retry_policy();
            match policy.run(|_| op(provider.clone())).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(provider = provider.name(), operation, error = %err, "provider failed, trying next");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ProviderError::Unavailable("no available provider".to_string())))
    }

    pub async fn generate_text_with_fallback(
        &self,
        request: &TextRequest,
        preferred: Option<&str>,
    ) -> Result<TextResponse, ProviderError> {
        self.with_fallback(preferred, "generate_text", |p| async move {
            p.generate_text(request).await
        })
        .await
    }

    pub async fn generate_embedding_with_fallback(
        &self,
        request: &EmbeddingRequest,
        preferred: Option<&str>,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.with_fallback(preferred, "generate_embedding", |p| async move {
            p.generate_embedding(request).await
        })
        .await
    }

    /// Embed `requests` in fixed-size groups. Each group goes through the
    /// fallback chain on its own; a failed group leaves `None` in its slots
    /// and does not stop the others.
    pub async fn batch_embed(
        &self,
        requests: &[EmbeddingRequest],
        preferred: Option<&str>,
    ) -> BatchEmbeddings {
        let mut out = BatchEmbeddings {
            results: Vec::with_capacity(requests.len()),
            failures: Vec::new(),
        };

        for (group_index, group) in requests.chunks(self.embedding_batch_size).enumerate() {
            let offset = group_index * self.embedding_batch_size;
            let result = self
                .with_fallback(preferred, "batch_embed", |p| async move {
                    let responses = p.batch_generate_embeddings(group).await?;
                    if responses.len() != group.len() {
                        return Err(ProviderError::InvalidResponse(format!(
                            "{} returned {} embeddings for {} inputs",
                            p.name(),
                            responses.len(),
                            group.len()
                        )));
                    }
                    Ok(responses)
                })
                .await;

            match result {
                Ok(responses) => out.results.extend(responses.into_iter().map(Some)),
                Err(error) => {
                    warn!(offset, len = group.len(), error = %error, "embedding group failed");
                    out.results.extend(std::iter::repeat_with(|| None).take(group.len()));
                    out.failures.push(GroupFailure {
                        offset,
                        len: group.len(),
                        error,
                    });
                }
            }
        }

        out
    }

    pub async fn health_check_all(&self) -> Vec<HealthStatus> {
        let mut statuses = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            statuses.push(provider.health_check().await);
        }
        statuses
    }

    pub async fn providers(&self) -> Vec<ProviderInfo> {
        let mut infos = Vec::with_capacity(self.providers.len());
        for (i, provider) in self.providers.iter().enumerate() {
            infos.push(ProviderInfo {
                name: provider.name().to_string(),
                primary: self.primary == Some(i),
                available: provider.is_available().await,
            });
        }
        infos
    }

    /// True when at least one provider reports itself available.
    pub async fn any_available(&self) -> bool {
        for provider in &self.providers {
            if provider.is_available().await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Scripted {
        name: &'static str,
        available: bool,
        failures_before_success: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, available: bool, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                available,
                failures_before_success: failures,
                error: ProviderError::Server {
                    status: 503,
                    message: "busy".into(),
                },
                calls: AtomicU32::new(0),
            })
        }

        fn failing(name: &'static str, error: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                name,
                available: true,
                failures_before_success: u32::MAX,
                error,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn attempt(&self) -> Result<(), ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::new(2, Duration::from_millis(1))
        }

        async fn generate_text(&self, _request: &TextRequest) -> Result<TextResponse, ProviderError> {
            self.attempt()?;
            Ok(TextResponse {
                text: format!("from {}", self.name),
                model: "m".into(),
                provider: self.name.into(),
                prompt_tokens: None,
                completion_tokens: None,
            })
        }

        async fn generate_embedding(
            &self,
            _request: &EmbeddingRequest,
        ) -> Result<EmbeddingResponse, ProviderError> {
            self.attempt()?;
            Ok(EmbeddingResponse {
                vector: vec![1.0, 0.0],
                model: "m".into(),
                provider: self.name.into(),
            })
        }

        async fn batch_generate_embeddings(
            &self,
            requests: &[EmbeddingRequest],
        ) -> Result<Vec<EmbeddingResponse>, ProviderError> {
            self.attempt()?;
            Ok(requests
                .iter()
                .map(|_| EmbeddingResponse {
                    vector: vec![1.0, 0.0],
                    model: "m".into(),
                    provider: self.name.into(),
                })
                .collect())
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::healthy(self.name, vec![])
        }
    }

    #[tokio::test]
    async fn test_fallback_skips_unavailable_and_retries() {
        let a = Scripted::new("a", false, 0);
        let b = Scripted::new("b", true, 2);
        let c = Scripted::new("c", true, 0);
        let mut manager = ProviderManager::new(8);
        manager.register(a.clone(), true);
        manager.register(b.clone(), false);
        manager.register(c.clone(), false);

        let response = manager
            .generate_text_with_fallback(&TextRequest::default(), None)
            .await
            .unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 3);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn test_preferred_goes_first() {
        let a = Scripted::new("a", true, 0);
        let b = Scripted::new("b", true, 0);
        let mut manager = ProviderManager::new(8);
        manager.register(a.clone(), true);
        manager.register(b.clone(), false);

        let response = manager
            .generate_embedding_with_fallback(&EmbeddingRequest::new("x"), Some("b"))
            .await
            .unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_moves_on_without_retry() {
        let a = Scripted::failing("a", ProviderError::Auth("nope".into()));
        let b = Scripted::new("b", true, 0);
        let mut manager = ProviderManager::new(8);
        manager.register(a.clone(), true);
        manager.register(b.clone(), false);

        let response = manager
            .generate_text_with_fallback(&TextRequest::default(), None)
            .await
            .unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_fail_returns_last_error() {
        let a = Scripted::failing("a", ProviderError::Auth("nope".into()));
        let b = Scripted::failing("b", ProviderError::InvalidModel("gone".into()));
        let mut manager = ProviderManager::new(8);
        manager.register(a, true);
        manager.register(b, false);

        let err = manager
            .generate_text_with_fallback(&TextRequest::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::InvalidModel("gone".into()));
    }

    #[tokio::test]
    async fn test_none_available_is_unavailable() {
        let mut manager = ProviderManager::new(8);
        manager.register(Scripted::new("a", false, 0), true);
        let err = manager
            .generate_text_with_fallback(&TextRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));

        let empty = ProviderManager::new(8);
        assert!(empty.primary_name().is_none());
        assert!(!empty.any_available().await);
    }

    #[tokio::test]
    async fn test_batch_embed_isolates_groups() {
        // Fails the first group's three attempts, then succeeds for the rest.
        let a = Scripted::new("a", true, 3);
        let mut manager = ProviderManager::new(2);
        manager.register(a.clone(), true);

        let requests: Vec<EmbeddingRequest> =
            (0..5).map(|i| EmbeddingRequest::new(format!("text {}", i))).collect();
        let batch = manager.batch_embed(&requests, None).await;

        assert_eq!(batch.results.len(), 5);
        assert!(batch.results[0].is_none());
        assert!(batch.results[1].is_none());
        assert!(batch.results[2..].iter().all(|r| r.is_some()));
        assert_eq!(batch.succeeded(), 3);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].offset, 0);
        assert_eq!(batch.failures[0].len, 2);
    }

    #[tokio::test]
    async fn test_provider_listing() {
        let mut manager = ProviderManager::new(8);
        manager.register(Scripted::new("a", false, 0), false);
        manager.register(Scripted::new("b", true, 0), true);
        let infos = manager.providers().await;
        assert_eq!(infos.len(), 2);
        assert!(!infos[0].primary && !infos[0].available);
        assert!(infos[1].primary && infos[1].available);
        assert_eq!(manager.primary_name(), Some("b"));
        assert_eq!(manager.health_check_all().await.len(), 2);
    }
}
