#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use docflow::config::Config;
use docflow::orchestrator::Orchestrator;
use docflow::provider::{
    EmbeddingRequest, EmbeddingResponse, HealthStatus, Provider, ProviderError, ProviderManager,
    RetryPolicy, TextRequest, TextResponse,
};

pub struct TestEnv {
    pub tmp: TempDir,
    pub pool: SqlitePool,
    pub config: Arc<Config>,
}

impl TestEnv {
    /// Directory for corpus files, inside the temp dir.
    pub fn corpus(&self) -> PathBuf {
        let dir = self.tmp.path().join("corpus");
        std::fs::create_dir_all(&dir).unwrap();
        dir.canonicalize().unwrap()
    }

    pub fn orchestrator(&self, providers: ProviderManager) -> Orchestrator {
        Orchestrator::new(self.pool.clone(), self.config.clone(), Arc::new(providers))
    }
}

pub async fn setup() -> TestEnv {
    setup_with(|_| {}).await
}

pub async fn setup_with(adjust: impl FnOnce(&mut Config)) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db.path = tmp.path().join("data").join("docflow.sqlite");
    config.chunking.max_tokens = 64;
    config.chunking.overlap_tokens = 8;
    config.chunking.min_tokens = 4;
    adjust(&mut config);

    let pool = docflow::db::connect(&config).await.unwrap();
    docflow::migrate::apply_schema(&pool).await.unwrap();

    TestEnv {
        tmp,
        pool,
        config: Arc::new(config),
    }
}

pub fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// In-process provider: summaries echo the input length, embeddings are a
/// letter histogram. Requests whose text contains `fail_marker` fail with a
/// permanent error.
pub struct FakeProvider {
    pub name: &'static str,
    pub fail_marker: Option<&'static str>,
    pub text_calls: AtomicU32,
    pub embed_calls: AtomicU32,
}

impl FakeProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fail_marker: None,
            text_calls: AtomicU32::new(0),
            embed_calls: AtomicU32::new(0),
        }
    }

    pub fn failing_on(name: &'static str, marker: &'static str) -> Self {
        Self {
            fail_marker: Some(marker),
            ..Self::new(name)
        }
    }

    fn check(&self, text: &str) -> Result<(), ProviderError> {
        match self.fail_marker {
            Some(marker) if text.contains(marker) => Err(ProviderError::Client {
                status: 400,
                message: "rejected".into(),
            }),
            _ => Ok(()),
        }
    }
}

pub fn letter_histogram(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
        v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1))
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&request.prompt)?;
        Ok(TextResponse {
            text: format!("summary of {} chars", request.prompt.len()),
            model: "fake-chat".into(),
            provider: self.name.into(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }

    async fn generate_embedding(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&request.text)?;
        Ok(EmbeddingResponse {
            vector: letter_histogram(&request.text),
            model: "fake-embed".into(),
            provider: self.name.into(),
        })
    }

    async fn batch_generate_embeddings(
        &self,
        requests: &[EmbeddingRequest],
    ) -> Result<Vec<EmbeddingResponse>, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        for request in requests {
            self.check(&request.text)?;
        }
        Ok(requests
            .iter()
            .map(|r| EmbeddingResponse {
                vector: letter_histogram(&r.text),
                model: "fake-embed".into(),
                provider: self.name.into(),
            })
            .collect())
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy(self.name, vec!["fake-chat".into(), "fake-embed".into()])
    }
}

pub fn fake_manager() -> ProviderManager {
    manager_with(Arc::new(FakeProvider::new("fake")))
}

pub fn manager_with(provider: Arc<FakeProvider>) -> ProviderManager {
    let mut manager = ProviderManager::new(8);
    manager.register(provider, true);
    manager
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    End,
}

/// Provider whose text calls take `delay` and are logged per document.
/// The document is identified by the `Document number N` phrase in the
/// prompt. Tracks the peak number of calls in flight.
pub struct SlowProvider {
    delay: Duration,
    in_flight: AtomicU32,
    pub peak: AtomicU32,
    pub log: std::sync::Mutex<Vec<(usize, Event)>>,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            log: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn document_number(prompt: &str) -> usize {
        let rest = prompt
            .split("Document number ")
            .nth(1)
            .expect("prompt names its document");
        rest.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .unwrap()
    }
}

#[async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        let doc = Self::document_number(&request.prompt);
        self.log.lock().unwrap().push((doc, Event::Start));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push((doc, Event::End));
        Ok(TextResponse {
            text: format!("summary of document {}", doc),
            model: "slow-chat".into(),
            provider: "slow".into(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }

    async fn generate_embedding(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        Ok(EmbeddingResponse {
            vector: letter_histogram(&request.text),
            model: "slow-embed".into(),
            provider: "slow".into(),
        })
    }

    async fn batch_generate_embeddings(
        &self,
        requests: &[EmbeddingRequest],
    ) -> Result<Vec<EmbeddingResponse>, ProviderError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.generate_embedding(request).await?);
        }
        Ok(out)
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("slow", vec!["slow-chat".into()])
    }
}
