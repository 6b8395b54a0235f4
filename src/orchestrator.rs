//! Pipeline orchestration.
//!
//! The [`Orchestrator`] ties the scanner and the per-document pipeline to the
//! job manager. A process run takes every pending document (optionally under
//! a root path), splits them into batches and runs each batch as spawned
//! tasks bounded by a semaphore. The batch is always fully awaited before
//! progress is recorded and the next batch starts, and cancellation is only
//! observed between batches.
//!
//! Per document the steps are:
//!
//! ```text
//! normalize → chunk → replace chunks → [summarize] → [embed] → [link]
//!           → mark processed → [publish]
//! ```
//!
//! A failing step marks that document `failed` and skips its remaining
//! steps. Sibling documents and the run itself carry on.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chunk::{self, ChunkParams, ChunkingStrategy};
use crate::config::Config;
use crate::db;
use crate::embed::Embedder;
use crate::error::{is_storage, PipelineError};
use crate::jobs::JobManager;
use crate::links::Linker;
use crate::models::{Document, Job, JobKind, JobState, Summary};
use crate::normalize;
use crate::outbox::{DocumentEvent, NoopPublisher, OutboxPublisher, ResultPublisher};
use crate::provider::{HealthStatus, ProviderInfo, ProviderManager};
use crate::repository;
use crate::scanner::{ScanResult, Scanner};
use crate::summarize::{SummaryRequest, SummaryType, Summarizer};

/// The document summary is built from this many leading chunks.
const SUMMARY_SOURCE_CHUNKS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Only documents under this directory; all pending documents when `None`.
    pub root_path: Option<PathBuf>,
    pub chunking_strategy: ChunkingStrategy,
    pub generate_summaries: bool,
    pub generate_embeddings: bool,
    pub generate_links: bool,
    pub summary_type: SummaryType,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub preferred_provider: Option<String>,
}

impl ProcessOptions {
    /// Options taken from the `[pipeline]` section.
    pub fn from_config(config: &Config) -> Self {
        let pipeline = &config.pipeline;
        Self {
            root_path: None,
            chunking_strategy: pipeline.chunking_strategy,
            generate_summaries: pipeline.generate_summaries,
            generate_embeddings: pipeline.generate_embeddings,
            generate_links: pipeline.generate_links,
            summary_type: pipeline.summary_type,
            batch_size: pipeline.batch_size,
            max_concurrent: pipeline.max_concurrent,
            preferred_provider: None,
        }
    }

    fn validate(&self) -> Result<Option<PathBuf>> {
        if self.batch_size == 0 {
            return Err(PipelineError::validation("batch_size must be greater than 0").into());
        }
        if self.max_concurrent == 0 {
            return Err(PipelineError::validation("max_concurrent must be greater than 0").into());
        }
        self.root_path.as_deref().map(validate_dir).transpose()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub uri: String,
    pub success: bool,
    pub chunks_created: usize,
    pub summaries_created: usize,
    pub embeddings_created: usize,
    pub links_created: usize,
    pub error: Option<String>,
}

impl DocumentOutcome {
    fn new(doc: &Document) -> Self {
        Self {
            document_id: doc.id.clone(),
            uri: doc.uri.clone(),
            success: false,
            chunks_created: 0,
            summaries_created: 0,
            embeddings_created: 0,
            links_created: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRun {
    pub job_id: String,
    pub result: ScanResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessRun {
    pub job_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the job was canceled before every batch ran.
    pub canceled: bool,
    pub outcomes: Vec<DocumentOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyReport {
    pub ready: bool,
    pub database: bool,
    pub providers: Vec<ProviderInfo>,
    /// One entry per registered provider, in registration order.
    pub health: Vec<HealthStatus>,
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: SqlitePool,
    config: Arc<Config>,
    jobs: JobManager,
    providers: Arc<ProviderManager>,
    publisher: Arc<dyn ResultPublisher>,
}

impl Orchestrator {
    /// Wire up an orchestrator over an open, migrated pool. The publisher
    /// follows `[outbox]`.
    pub fn new(pool: SqlitePool, config: Arc<Config>, providers: Arc<ProviderManager>) -> Self {
        let publisher: Arc<dyn ResultPublisher> = if config.outbox.enabled {
            Arc::new(OutboxPublisher::new(pool.clone(), config.outbox.topic.clone()))
        } else {
            Arc::new(NoopPublisher)
        };
        Self::with_publisher(pool, config, providers, publisher)
    }

    pub fn with_publisher(
        pool: SqlitePool,
        config: Arc<Config>,
        providers: Arc<ProviderManager>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            jobs: JobManager::new(pool.clone()),
            pool,
            config,
            providers,
            publisher,
        }
    }

    /// Open the configured database and build the configured providers.
    pub async fn from_config(config: Arc<Config>) -> Result<Self> {
        let pool = db::connect(&config).await?;
        crate::migrate::apply_schema(&pool).await?;
        let providers = Arc::new(ProviderManager::from_config(&config.providers)?);
        Ok(Self::new(pool, config, providers))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.providers
    }

    // ============ Scan ============

    /// Scan `root` as a tracked job and wait for it.
    #[instrument(skip(self, root), fields(root = %root.display()))]
    pub async fn scan(&self, root: &Path, recursive: bool) -> Result<ScanRun> {
        let root = validate_dir(root)?;
        let job_id = self.create_scan_job(&root, recursive).await?;
        let result = self.run_scan_job(&job_id, &root, recursive).await?;
        Ok(ScanRun { job_id, result })
    }

    /// Start a scan job in the background and return its id.
    pub async fn submit_scan(&self, root: &Path, recursive: bool) -> Result<String> {
        let root = validate_dir(root)?;
        let job_id = self.create_scan_job(&root, recursive).await?;

        let this = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_scan_job(&id, &root, recursive).await {
                error!(job_id = %id, error = %format!("{:#}", e), "scan job failed");
            }
        });
        Ok(job_id)
    }

    async fn create_scan_job(&self, root: &Path, recursive: bool) -> Result<String> {
        let params = serde_json::json!({
            "root_path": root.display().to_string(),
            "recursive": recursive,
        });
        self.jobs.create_job(JobKind::Scan, &params).await
    }

    async fn run_scan_job(&self, job_id: &str, root: &Path, recursive: bool) -> Result<ScanResult> {
        if !self.jobs.update_state(job_id, JobState::Running, None).await? {
            info!(job_id, "scan job no longer runnable, skipping");
            return Ok(ScanResult::default());
        }

        let scanner = Scanner::new(self.pool.clone(), self.config.scanner.clone());
        match scanner.scan(root, recursive).await {
            Ok(result) => {
                let (total, succeeded, failed) = scan_counts(&result);
                self.jobs
                    .update_progress(job_id, total, total, succeeded, failed)
                    .await?;
                self.jobs
                    .update_state(job_id, JobState::Succeeded, None)
                    .await?;
                Ok(result)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.jobs
                    .update_state(job_id, JobState::Failed, Some(&message))
                    .await?;
                Err(e)
            }
        }
    }

    // ============ Process ============

    /// Process pending documents as a tracked job and wait for it.
    #[instrument(skip(self, options), fields(batch_size = options.batch_size, max_concurrent = options.max_concurrent))]
    pub async fn process(&self, options: ProcessOptions) -> Result<ProcessRun> {
        let prefix = options.validate()?;
        let job_id = self
            .jobs
            .create_job(JobKind::Process, &serde_json::to_value(&options)?)
            .await?;
        self.run_process_job(&job_id, &options, prefix.as_deref()).await
    }

    /// Start a process job in the background and return its id.
    pub async fn submit_process(&self, options: ProcessOptions) -> Result<String> {
        let prefix = options.validate()?;
        let job_id = self
            .jobs
            .create_job(JobKind::Process, &serde_json::to_value(&options)?)
            .await?;

        let this = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_process_job(&id, &options, prefix.as_deref()).await {
                error!(job_id = %id, error = %format!("{:#}", e), "process job failed");
            }
        });
        Ok(job_id)
    }

    async fn run_process_job(
        &self,
        job_id: &str,
        options: &ProcessOptions,
        root: Option<&Path>,
    ) -> Result<ProcessRun> {
        let mut run = ProcessRun {
            job_id: job_id.to_string(),
            ..Default::default()
        };
        if !self.jobs.update_state(job_id, JobState::Running, None).await? {
            info!(job_id, "process job no longer runnable, skipping");
            run.canceled = true;
            return Ok(run);
        }

        match self.run_batches(job_id, options, root, &mut run).await {
            Ok(()) => {}
            Err(e) => {
                let message = format!("{:#}", e);
                self.jobs
                    .update_state(job_id, JobState::Failed, Some(&message))
                    .await?;
                return Err(e);
            }
        }

        if !run.canceled {
            let applied = if run.failed == 0 {
                self.jobs
                    .update_state(job_id, JobState::Succeeded, None)
                    .await?
            } else {
                let error = PipelineError::PartialBatchFailure {
                    failed: run.failed as u64,
                    total: run.total as u64,
                };
                self.jobs
                    .update_state(job_id, JobState::Failed, Some(&error.to_string()))
                    .await?
            };
            // A cancel that lands during the last batch wins the final state.
            if !applied {
                run.canceled = self.jobs.is_canceled(job_id).await?;
            }
        }
        if run.canceled {
            info!(job_id, processed = run.outcomes.len(), total = run.total, "process job canceled");
        }

        info!(
            job_id,
            total = run.total,
            succeeded = run.succeeded,
            failed = run.failed,
            "process job finished"
        );
        Ok(run)
    }

    async fn run_batches(
        &self,
        job_id: &str,
        options: &ProcessOptions,
        root: Option<&Path>,
        run: &mut ProcessRun,
    ) -> Result<()> {
        let prefix = root.map(|r| format!("{}{}", r.display(), std::path::MAIN_SEPARATOR));
        let documents = repository::pending_documents(&self.pool, prefix.as_deref()).await?;
        run.total = documents.len();
        self.jobs
            .update_progress(job_id, 0, run.total as i64, 0, 0)
            .await?;
        info!(job_id, documents = run.total, "processing pending documents");

        let semaphore = Arc::new(Semaphore::new(options.max_concurrent));
        for (index, batch) in documents.chunks(options.batch_size).enumerate() {
            if self.jobs.is_canceled(job_id).await? {
                run.canceled = true;
                break;
            }
            debug!(job_id, batch = index, size = batch.len(), "starting batch");

            let mut handles = Vec::with_capacity(batch.len());
            for doc in batch {
                let this = self.clone();
                let options = options.clone();
                let semaphore = semaphore.clone();
                let doc = doc.clone();
                let fallback = DocumentOutcome::new(&doc);
                let handle = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| anyhow::anyhow!("Semaphore error: {}", e))?;
                    Ok::<_, anyhow::Error>(this.process_document(&doc, &options).await)
                });
                handles.push((fallback, handle));
            }

            for (mut fallback, handle) in handles {
                let outcome = match handle.await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        fallback.error = Some(format!("{:#}", e));
                        fallback
                    }
                    Err(join_err) => {
                        let message = format!("document task aborted: {}", join_err);
                        error!(document_id = %fallback.document_id, error = %message, "document task panicked");
                        if let Err(e) =
                            repository::mark_failed(&self.pool, &fallback.document_id, &message).await
                        {
                            warn!(document_id = %fallback.document_id, error = %e, "failed to record document failure");
                        }
                        fallback.error = Some(message);
                        fallback
                    }
                };
                if outcome.success {
                    run.succeeded += 1;
                } else {
                    run.failed += 1;
                }
                run.outcomes.push(outcome);
            }

            self.jobs
                .update_progress(
                    job_id,
                    run.outcomes.len() as i64,
                    run.total as i64,
                    run.succeeded as i64,
                    run.failed as i64,
                )
                .await?;
        }
        Ok(())
    }

    /// Run one document through the pipeline. Never fails: errors are
    /// recorded on the document and in the outcome.
    pub async fn process_document(&self, doc: &Document, options: &ProcessOptions) -> DocumentOutcome {
        let mut outcome = DocumentOutcome::new(doc);
        match self.run_document(doc, options, &mut outcome).await {
            Ok(()) => {
                outcome.success = true;
                debug!(
                    document_id = %doc.id,
                    chunks = outcome.chunks_created,
                    summaries = outcome.summaries_created,
                    embeddings = outcome.embeddings_created,
                    "document processed"
                );
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if is_storage(&e) {
                    error!(document_id = %doc.id, uri = %doc.uri, error = %message, "document failed on catalog write");
                } else {
                    warn!(document_id = %doc.id, uri = %doc.uri, error = %message, "document failed");
                }
                if let Err(e) = repository::mark_failed(&self.pool, &doc.id, &message).await {
                    error!(document_id = %doc.id, error = %e, "failed to record document failure");
                }
                outcome.error = Some(message);
            }
        }
        outcome
    }

    async fn run_document(
        &self,
        doc: &Document,
        options: &ProcessOptions,
        outcome: &mut DocumentOutcome,
    ) -> Result<()> {
        let path = PathBuf::from(doc.path.as_deref().unwrap_or(&doc.uri));
        let normalized = normalize::normalize_file(&path, &self.config.normalize).await?;

        let params = ChunkParams::from(&self.config.chunking);
        let chunked = chunk::chunk_text(&normalized.text, options.chunking_strategy, &params);
        let stored = repository::replace_chunks(&self.pool, &doc.id, &chunked.chunks).await?;
        outcome.chunks_created = stored.len();

        let title = normalized.title.clone().or_else(|| doc.title.clone());
        let preferred = options.preferred_provider.as_deref();

        if options.generate_summaries && !stored.is_empty() {
            let source = stored
                .iter()
                .take(SUMMARY_SOURCE_CHUNKS)
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let mut request = SummaryRequest::new(source, options.summary_type);
            request.context = title.as_ref().map(|t| format!("Title: {}", t));

            let result = Summarizer::new(self.providers.clone())
                .summarize(&request, preferred)
                .await?;
            repository::insert_summary(
                &self.pool,
                &Summary {
                    id: Uuid::new_v4().to_string(),
                    document_id: doc.id.clone(),
                    chunk_id: None,
                    model: result.model,
                    text: result.summary,
                    created_at: chrono::Utc::now().timestamp(),
                },
            )
            .await?;
            outcome.summaries_created = 1;
        }

        if options.generate_embeddings && !stored.is_empty() {
            let embedded = Embedder::new(self.pool.clone(), self.providers.clone())
                .embed_chunks(&stored, preferred)
                .await?;
            outcome.embeddings_created = embedded.embedded;

            if options.generate_links {
                if let Some((provider, model)) = &embedded.provider_model {
                    outcome.links_created =
                        Linker::new(self.pool.clone(), self.config.linking.clone())
                            .link_document(&doc.id, provider, model)
                            .await?;
                }
            }
        }

        let mut metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&doc.metadata_json).unwrap_or_default();
        metadata.extend(normalized.metadata.clone());
        metadata.insert("word_count".into(), normalized.word_count.into());
        metadata.insert("char_count".into(), normalized.char_count.into());
        metadata.insert("chunk_count".into(), stored.len().into());
        metadata.insert("total_tokens".into(), chunked.total_tokens.into());
        metadata.insert(
            "chunking_strategy".into(),
            options.chunking_strategy.as_str().into(),
        );
        repository::mark_processed(
            &self.pool,
            &doc.id,
            title.as_deref(),
            &serde_json::Value::Object(metadata).to_string(),
        )
        .await?;

        let event = DocumentEvent {
            document_id: doc.id.clone(),
            uri: doc.uri.clone(),
            title,
            chunks: outcome.chunks_created,
            summaries: outcome.summaries_created,
            embeddings: outcome.embeddings_created,
            processed_at: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(document_id = %doc.id, error = %e, "failed to publish processed event");
        }
        Ok(())
    }

    // ============ Jobs & status ============

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.jobs.get_job(id).await
    }

    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        self.jobs.list_jobs(state, limit).await
    }

    /// Request cancellation. Running batches finish; no new batch starts.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        self.jobs.cancel_job(id).await
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Ready when the database answers and, if any step needs a provider,
    /// at least one provider is available. Health checks are reported but do
    /// not gate readiness.
    pub async fn ready(&self) -> ReadyReport {
        let database = match db::ping(&self.pool).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "database not ready");
                false
            }
        };
        let needs_provider =
            self.config.pipeline.generate_summaries || self.config.pipeline.generate_embeddings;
        let provider_ready = !needs_provider || self.providers.any_available().await;
        ReadyReport {
            ready: database && provider_ready,
            database,
            providers: self.providers.providers().await,
            health: self.providers.health_check_all().await,
        }
    }
}

/// Job counters for a finished scan as `(total, succeeded, failed)`.
///
/// Every tracked file is a unit, and so is every entry that errored without
/// being tracked. Files kept under a fallback hash count as failed.
fn scan_counts(result: &ScanResult) -> (i64, i64, i64) {
    let errors = result.errors.len() as i64;
    let hash_failures = result.hash_failures as i64;
    let tracked = result.total as i64;
    let untracked = errors - hash_failures;
    (tracked + untracked, tracked - hash_failures, errors)
}

fn validate_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(PipelineError::validation(format!(
            "Not an existing directory: {}",
            path.display()
        ))
        .into());
    }
    Ok(path.canonicalize()?)
}
