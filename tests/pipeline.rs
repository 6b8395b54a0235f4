mod common;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use docflow::error::is_validation;
use docflow::jobs::JobManager;
use docflow::models::{DocumentStatus, JobState};
use docflow::orchestrator::{Orchestrator, ProcessOptions};
use docflow::outbox::{DocumentEvent, OutboxPublisher, ResultPublisher};
use docflow::provider::ProviderManager;
use docflow::repository;

use common::Event;

fn options(env: &common::TestEnv) -> ProcessOptions {
    ProcessOptions::from_config(&env.config)
}

fn paragraph(seed: usize) -> String {
    format!(
        "Document number {} explains how the ingestion pipeline handles files. \
         It is split into sentences so the chunker has boundaries to work with. \
         Every sentence carries enough words to matter.",
        seed
    )
}

#[tokio::test]
async fn test_end_to_end_three_files() {
    let env = common::setup().await;
    let corpus = env.corpus();
    let front = common::write(
        &corpus,
        "front.md",
        "---\ntitle: Front Matter Doc\nauthor: docs-team\n---\n# Heading\n\nA short body with a few words in it.\n",
    );
    let empty = common::write(&corpus, "empty.txt", "");
    let large_text: String = (0..400).map(|i| format!("{}\n\n", paragraph(i))).collect();
    assert!(large_text.len() >= 50 * 1024);
    let large = common::write(&corpus, "large.txt", &large_text);

    let orchestrator = env.orchestrator(common::fake_manager());
    let scan = orchestrator.scan(&corpus, true).await.unwrap();
    assert_eq!(scan.result.total, 3);
    assert_eq!(scan.result.new, 3);

    let mut opts = options(&env);
    opts.batch_size = 2;
    opts.max_concurrent = 2;
    let run = orchestrator.process(opts).await.unwrap();
    assert_eq!(run.total, 3);
    assert_eq!(run.succeeded, 3);
    assert_eq!(run.failed, 0);

    let by_uri = |path: &std::path::Path| {
        let uri = path.display().to_string();
        run.outcomes.iter().find(|o| o.uri == uri).unwrap().clone()
    };
    assert_eq!(by_uri(&empty).chunks_created, 0);
    assert!(by_uri(&front).chunks_created > 0);
    let large_outcome = by_uri(&large);
    assert!(large_outcome.chunks_created > 1);
    assert_eq!(large_outcome.embeddings_created, large_outcome.chunks_created);
    assert_eq!(large_outcome.summaries_created, 1);

    for path in [&front, &empty, &large] {
        let doc = repository::get_document_by_uri(&env.pool, &path.display().to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
    }

    let front_doc = repository::get_document_by_uri(&env.pool, &front.display().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(front_doc.title.as_deref(), Some("Front Matter Doc"));
    let metadata: serde_json::Value = serde_json::from_str(&front_doc.metadata_json).unwrap();
    assert_eq!(metadata["author"], "docs-team");
    assert!(metadata["chunk_count"].as_u64().unwrap() > 0);

    let summary = repository::latest_summary(&env.pool, &front_doc.id)
        .await
        .unwrap()
        .unwrap();
    assert!(summary.chunk_id.is_none());
    assert_eq!(summary.model, "fake-chat");

    let job = orchestrator.get_job(&run.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.succeeded, 3);
    assert_eq!(job.total, 3);
    assert!((job.progress - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_one_failing_document_does_not_affect_batch() {
    let env = common::setup().await;
    let corpus = env.corpus();
    let mut paths = Vec::new();
    for i in 0..10 {
        paths.push(common::write(&corpus, &format!("doc{:02}.md", i), &paragraph(i)));
    }

    let orchestrator = env.orchestrator(common::fake_manager());
    orchestrator.scan(&corpus, true).await.unwrap();
    // The file vanishes between scan and process, so normalization cannot read it.
    std::fs::remove_file(&paths[3]).unwrap();

    let mut opts = options(&env);
    opts.batch_size = 4;
    opts.max_concurrent = 3;
    let run = orchestrator.process(opts).await.unwrap();
    assert_eq!(run.succeeded, 9);
    assert_eq!(run.failed, 1);

    let job = orchestrator.get_job(&run.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.succeeded, 9);
    assert_eq!(job.failed, 1);
    assert!(job.error.unwrap().contains("1 of 10"));

    for (i, path) in paths.iter().enumerate() {
        let doc = repository::get_document_by_uri(&env.pool, &path.display().to_string())
            .await
            .unwrap()
            .unwrap();
        if i == 3 {
            assert_eq!(doc.status, DocumentStatus::Failed);
            assert!(doc.error_message.is_some());
        } else {
            assert_eq!(doc.status, DocumentStatus::Processed);
            let chunks = repository::chunks_for_document(&env.pool, &doc.id).await.unwrap();
            assert!(!chunks.is_empty());
        }
    }
}

#[tokio::test]
async fn test_provider_failure_marks_document_failed() {
    let env = common::setup().await;
    let corpus = env.corpus();
    let bad = common::write(&corpus, "bad.md", "This text contains POISON and is rejected.");
    common::write(&corpus, "good.md", "This text is perfectly fine for the provider.");

    let provider = Arc::new(common::FakeProvider::failing_on("fake", "POISON"));
    let orchestrator = env.orchestrator(common::manager_with(provider.clone()));
    orchestrator.scan(&corpus, true).await.unwrap();
    let run = orchestrator.process(options(&env)).await.unwrap();

    assert_eq!(run.succeeded, 1);
    assert_eq!(run.failed, 1);
    let failed = run.outcomes.iter().find(|o| !o.success).unwrap();
    assert_eq!(failed.uri, bad.display().to_string());
    assert!(failed.error.as_ref().unwrap().contains("rejected"));

    // A permanent error is not retried: one call per document.
    assert_eq!(provider.text_calls.load(Ordering::SeqCst), 2);

    let doc = repository::get_document_by_uri(&env.pool, &failed.uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
}

#[tokio::test]
async fn test_invalid_options_create_no_job() {
    let env = common::setup().await;
    let orchestrator = env.orchestrator(common::fake_manager());

    let mut opts = options(&env);
    opts.batch_size = 0;
    assert!(is_validation(&orchestrator.process(opts).await.unwrap_err()));

    let mut opts = options(&env);
    opts.max_concurrent = 0;
    assert!(is_validation(&orchestrator.submit_process(opts).await.unwrap_err()));

    let mut opts = options(&env);
    opts.root_path = Some(env.tmp.path().join("missing"));
    assert!(is_validation(&orchestrator.process(opts).await.unwrap_err()));

    assert!(orchestrator.list_jobs(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_root_path_limits_processing() {
    let env = common::setup().await;
    let corpus = env.corpus();
    common::write(&corpus, "a/one.md", &paragraph(1));
    common::write(&corpus, "b/two.md", &paragraph(2));

    let orchestrator = env.orchestrator(common::fake_manager());
    orchestrator.scan(&corpus, true).await.unwrap();

    let mut opts = options(&env);
    opts.root_path = Some(corpus.join("a"));
    let run = orchestrator.process(opts).await.unwrap();
    assert_eq!(run.total, 1);

    let pending = repository::pending_documents(&env.pool, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].uri.ends_with("two.md"));
}

#[tokio::test]
async fn test_reprocessing_replaces_chunks() {
    let env = common::setup().await;
    let corpus = env.corpus();
    let path = common::write(&corpus, "doc.md", &paragraph(1));
    let orchestrator = env.orchestrator(common::fake_manager());

    orchestrator.scan(&corpus, true).await.unwrap();
    orchestrator.process(options(&env)).await.unwrap();

    let long: String = (0..20).map(paragraph).collect::<Vec<_>>().join("\n\n");
    std::fs::write(&path, long).unwrap();
    let rescan = orchestrator.scan(&corpus, true).await.unwrap();
    assert_eq!(rescan.result.changed, 1);
    let run = orchestrator.process(options(&env)).await.unwrap();
    assert_eq!(run.succeeded, 1);

    let doc = repository::get_document_by_uri(&env.pool, &path.display().to_string())
        .await
        .unwrap()
        .unwrap();
    let chunks = repository::chunks_for_document(&env.pool, &doc.id).await.unwrap();
    assert_eq!(chunks.len(), run.outcomes[0].chunks_created);
    let ordinals: Vec<i64> = chunks.iter().map(|c| c.ordinal).collect();
    assert_eq!(ordinals, (0..chunks.len() as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_nothing_pending_succeeds() {
    let env = common::setup().await;
    let orchestrator = env.orchestrator(common::fake_manager());
    let run = orchestrator.process(options(&env)).await.unwrap();
    assert_eq!(run.total, 0);
    let job = orchestrator.get_job(&run.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.progress, 0.0);
}

/// Cancels every active job the first time a document is published.
struct CancelOnPublish {
    jobs: JobManager,
}

#[async_trait]
impl ResultPublisher for CancelOnPublish {
    async fn publish(&self, _event: &DocumentEvent) -> Result<()> {
        for job in self.jobs.active_jobs().await? {
            self.jobs.cancel_job(&job.id).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_stops_at_batch_boundary() {
    let env = common::setup().await;
    let corpus = env.corpus();
    for i in 0..3 {
        common::write(&corpus, &format!("doc{}.md", i), &paragraph(i));
    }

    let publisher = Arc::new(CancelOnPublish {
        jobs: JobManager::new(env.pool.clone()),
    });
    let orchestrator = Orchestrator::with_publisher(
        env.pool.clone(),
        env.config.clone(),
        Arc::new(common::fake_manager()),
        publisher,
    );
    orchestrator.scan(&corpus, true).await.unwrap();

    let mut opts = options(&env);
    opts.batch_size = 1;
    opts.max_concurrent = 1;
    let run = orchestrator.process(opts).await.unwrap();

    assert!(run.canceled);
    assert_eq!(run.outcomes.len(), 1);
    let job = orchestrator.get_job(&run.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Canceled);
    assert_eq!(repository::pending_documents(&env.pool, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancel_during_last_batch_is_reported() {
    let env = common::setup().await;
    let corpus = env.corpus();
    common::write(&corpus, "only.md", &paragraph(0));

    let publisher = Arc::new(CancelOnPublish {
        jobs: JobManager::new(env.pool.clone()),
    });
    let orchestrator = Orchestrator::with_publisher(
        env.pool.clone(),
        env.config.clone(),
        Arc::new(common::fake_manager()),
        publisher,
    );
    orchestrator.scan(&corpus, true).await.unwrap();

    let run = orchestrator.process(options(&env)).await.unwrap();

    // The only batch ran to completion, but the job was canceled under it.
    assert!(run.canceled);
    assert_eq!(run.succeeded, 1);
    let job = orchestrator.get_job(&run.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Canceled);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_concurrency_bound_and_batch_barrier() {
    let env = common::setup().await;
    let corpus = env.corpus();
    for i in 0..7 {
        common::write(&corpus, &format!("doc{}.md", i), &paragraph(i));
    }

    let provider = Arc::new(common::SlowProvider::new(Duration::from_millis(50)));
    let mut manager = ProviderManager::new(8);
    manager.register(provider.clone(), true);
    let orchestrator = env.orchestrator(manager);
    orchestrator.scan(&corpus, true).await.unwrap();

    let mut opts = options(&env);
    opts.batch_size = 3;
    opts.max_concurrent = 2;
    opts.generate_embeddings = false;
    let run = orchestrator.process(opts).await.unwrap();
    assert_eq!(run.succeeded, 7);

    assert_eq!(provider.peak.load(Ordering::SeqCst), 2);

    // Pending documents are taken in URI order: doc0..doc6.
    let log = provider.log.lock().unwrap().clone();
    assert_eq!(log.len(), 14);
    let batch_of = |doc: usize| doc / 3;
    for batch in 0..2 {
        let last_end = log
            .iter()
            .rposition(|(doc, e)| batch_of(*doc) == batch && *e == Event::End)
            .unwrap();
        let next_start = log
            .iter()
            .position(|(doc, e)| batch_of(*doc) == batch + 1 && *e == Event::Start)
            .unwrap();
        assert!(
            last_end < next_start,
            "batch {} overlapped the next one: {:?}",
            batch,
            log
        );
    }
}

#[tokio::test]
async fn test_outbox_receives_processed_events() {
    let env = common::setup_with(|c| c.outbox.enabled = true).await;
    let corpus = env.corpus();
    common::write(&corpus, "a.md", &paragraph(1));
    common::write(&corpus, "b.md", &paragraph(2));

    let orchestrator = env.orchestrator(common::fake_manager());
    orchestrator.scan(&corpus, true).await.unwrap();
    orchestrator.process(options(&env)).await.unwrap();

    let outbox = OutboxPublisher::new(env.pool.clone(), env.config.outbox.topic.clone());
    let events = outbox.pending(10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].topic, "document.processed");
    assert!(events[0].payload["chunks"].as_u64().unwrap() > 0);

    assert!(outbox.mark_delivered(&events[0].id).await.unwrap());
    assert!(!outbox.mark_delivered(&events[0].id).await.unwrap());
    assert_eq!(outbox.pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_links_connect_similar_chunks() {
    let env = common::setup().await;
    let corpus = env.corpus();
    common::write(&corpus, "a.md", &paragraph(1));
    common::write(&corpus, "b.md", &paragraph(1));

    let orchestrator = env.orchestrator(common::fake_manager());
    orchestrator.scan(&corpus, true).await.unwrap();
    let mut opts = options(&env);
    opts.generate_links = true;
    opts.max_concurrent = 1;
    opts.batch_size = 1;
    let run = orchestrator.process(opts).await.unwrap();
    assert_eq!(run.failed, 0);

    // The second document links back to the identical first one.
    assert!(run.outcomes[1].links_created > 0);
    let stats = repository::catalog_stats(&env.pool).await.unwrap();
    assert!(stats.links > 0);
}

#[tokio::test]
async fn test_steps_can_be_disabled() {
    let env = common::setup().await;
    let corpus = env.corpus();
    common::write(&corpus, "a.md", &paragraph(1));

    let provider = Arc::new(common::FakeProvider::new("fake"));
    let orchestrator = env.orchestrator(common::manager_with(provider.clone()));
    orchestrator.scan(&corpus, true).await.unwrap();

    let mut opts = options(&env);
    opts.generate_summaries = false;
    opts.generate_embeddings = false;
    let run = orchestrator.process(opts).await.unwrap();
    assert_eq!(run.succeeded, 1);
    assert_eq!(run.outcomes[0].summaries_created, 0);
    assert_eq!(run.outcomes[0].embeddings_created, 0);
    assert_eq!(provider.text_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_submitted_scan_completes_in_background() {
    let env = common::setup().await;
    let corpus = env.corpus();
    common::write(&corpus, "a.md", "alpha");
    let orchestrator = env.orchestrator(common::fake_manager());

    let job_id = orchestrator.submit_scan(&corpus, true).await.unwrap();
    let mut state = JobState::Queued;
    for _ in 0..100 {
        state = orchestrator.get_job(&job_id).await.unwrap().unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(state, JobState::Succeeded);
    assert_eq!(repository::catalog_stats(&env.pool).await.unwrap().pending, 1);
}
