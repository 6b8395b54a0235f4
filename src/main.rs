//! # docflow CLI
//!
//! The `docflow` binary drives the ingestion pipeline: it scans document
//! trees into the catalog, processes pending documents, inspects and
//! cancels jobs, and serves the HTTP control API.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow init` | Create the SQLite database and schema |
//! | `docflow scan <root>` | Detect new, changed and deleted files |
//! | `docflow process` | Run pending documents through the pipeline |
//! | `docflow jobs list` | List recent jobs |
//! | `docflow jobs show <id>` | Show one job |
//! | `docflow jobs stats` | Job counts and mean duration |
//! | `docflow cancel <id>` | Cancel a queued or running job |
//! | `docflow cleanup` | Delete old finished jobs |
//! | `docflow docs` | List catalog documents |
//! | `docflow stats` | Catalog counts |
//! | `docflow outbox pending` | Show undelivered outbox events |
//! | `docflow outbox ack <id>` | Mark an outbox event delivered |
//! | `docflow health` | Database and provider readiness |
//! | `docflow serve` | Start the HTTP server |
//!
//! Results go to stdout; logs go to stderr (`RUST_LOG`, default
//! `docflow=info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docflow::chunk::ChunkingStrategy;
use docflow::config;
use docflow::error::PipelineError;
use docflow::migrate;
use docflow::models::{DocumentStatus, JobState};
use docflow::orchestrator::{Orchestrator, ProcessOptions};
use docflow::outbox::OutboxPublisher;
use docflow::repository;
use docflow::server;
use docflow::summarize::SummaryType;

/// docflow: incremental document ingestion with chunking, summaries and
/// embeddings.
#[derive(Parser)]
#[command(name = "docflow", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// apply.
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema. Safe to run repeatedly.
    Init,

    /// Scan a directory and update the catalog.
    Scan {
        /// Directory to scan.
        root: PathBuf,

        /// Only scan the root's direct children.
        #[arg(long)]
        no_recursive: bool,
    },

    /// Process pending documents.
    Process {
        /// Only documents under this directory.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Chunking strategy: `token`, `sentence` or `paragraph`.
        #[arg(long)]
        strategy: Option<ChunkingStrategy>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Summary type: `brief`, `detailed`, `keywords` or `bullet`.
        #[arg(long)]
        summary_type: Option<SummaryType>,

        #[arg(long)]
        no_summaries: bool,

        #[arg(long)]
        no_embeddings: bool,

        /// Link chunks by embedding similarity.
        #[arg(long)]
        links: bool,

        /// Try this provider before the configured primary.
        #[arg(long)]
        provider: Option<String>,
    },

    /// Inspect jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Cancel a queued or running job.
    Cancel { id: String },

    /// Delete finished jobs older than the retention period.
    Cleanup {
        /// Overrides `[jobs].retention_days`.
        #[arg(long)]
        older_than_days: Option<i64>,
    },

    /// List catalog documents.
    Docs {
        /// `pending`, `processed` or `failed`.
        #[arg(long)]
        status: Option<DocumentStatus>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Catalog counts.
    Stats,

    /// Drain the outbox.
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },

    /// Check database and provider readiness.
    Health,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum JobsAction {
    /// Newest first.
    List {
        /// `queued`, `running`, `succeeded`, `failed` or `canceled`.
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Show {
        id: String,
    },
    Stats,
}

#[derive(Subcommand)]
enum OutboxAction {
    Pending {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Ack {
        id: String,
    },
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("docflow=info"))
        .context("Failed to create tracing filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    }
    .context("Failed to initialize tracing")?;

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized at {}", cfg.db.path.display());
        return Ok(());
    }

    let orchestrator = Orchestrator::from_config(Arc::new(cfg)).await?;
    let json = cli.json;

    match cli.command {
        Commands::Init => {}
        Commands::Scan { root, no_recursive } => {
            let run = orchestrator.scan(&root, !no_recursive).await?;
            if json {
                print_json(&run)?;
            } else {
                let r = &run.result;
                println!("Scan job {}", run.job_id);
                println!("  total:     {}", r.total);
                println!("  new:       {}", r.new);
                println!("  changed:   {}", r.changed);
                println!("  unchanged: {}", r.unchanged);
                println!("  deleted:   {}", r.deleted);
                for error in &r.errors {
                    println!("  error: {}: {}", error.path, error.message);
                }
            }
        }
        Commands::Process {
            root,
            strategy,
            batch_size,
            max_concurrent,
            summary_type,
            no_summaries,
            no_embeddings,
            links,
            provider,
        } => {
            let mut options = ProcessOptions::from_config(orchestrator.config());
            options.root_path = root;
            if let Some(strategy) = strategy {
                options.chunking_strategy = strategy;
            }
            if let Some(n) = batch_size {
                options.batch_size = n;
            }
            if let Some(n) = max_concurrent {
                options.max_concurrent = n;
            }
            if let Some(t) = summary_type {
                options.summary_type = t;
            }
            options.generate_summaries &= !no_summaries;
            options.generate_embeddings &= !no_embeddings;
            options.generate_links |= links;
            options.preferred_provider = provider;

            let run = orchestrator.process(options).await?;
            if json {
                print_json(&run)?;
            } else {
                println!("Process job {}", run.job_id);
                for outcome in &run.outcomes {
                    match &outcome.error {
                        None => println!(
                            "  ok     {} ({} chunks, {} summaries, {} embeddings)",
                            outcome.uri,
                            outcome.chunks_created,
                            outcome.summaries_created,
                            outcome.embeddings_created
                        ),
                        Some(e) => println!("  failed {}: {}", outcome.uri, e),
                    }
                }
                println!(
                    "  {} documents, {} succeeded, {} failed{}",
                    run.total,
                    run.succeeded,
                    run.failed,
                    if run.canceled { " (canceled)" } else { "" }
                );
            }
            if run.failed > 0 {
                return Err(PipelineError::PartialBatchFailure {
                    failed: run.failed as u64,
                    total: run.total as u64,
                }
                .into());
            }
        }
        Commands::Jobs { action } => match action {
            JobsAction::List { state, limit } => {
                let jobs = orchestrator.list_jobs(state, limit).await?;
                if json {
                    print_json(&jobs)?;
                } else if jobs.is_empty() {
                    println!("No jobs.");
                } else {
                    for job in &jobs {
                        println!(
                            "{}  {:<8} {:<9} {}/{} ok={} failed={}",
                            job.id, job.kind.as_str(), job.state.as_str(), job.current, job.total, job.succeeded, job.failed
                        );
                    }
                }
            }
            JobsAction::Show { id } => {
                let job = orchestrator
                    .get_job(&id)
                    .await?
                    .with_context(|| format!("No job with id: {}", id))?;
                if json {
                    print_json(&job)?;
                } else {
                    println!("Job {}", job.id);
                    println!("  kind:      {}", job.kind);
                    println!("  state:     {}", job.state);
                    println!("  progress:  {:.0}% ({}/{})", job.progress * 100.0, job.current, job.total);
                    println!("  succeeded: {}", job.succeeded);
                    println!("  failed:    {}", job.failed);
                    if let Some(secs) = job.duration_secs() {
                        println!("  duration:  {}s", secs);
                    }
                    if let Some(error) = &job.error {
                        println!("  error:     {}", error);
                    }
                }
            }
            JobsAction::Stats => {
                let stats = orchestrator.jobs().statistics().await?;
                if json {
                    print_json(&stats)?;
                } else {
                    println!("Jobs: {}", stats.total);
                    for (state, n) in &stats.by_state {
                        println!("  {:<9} {}", state, n);
                    }
                    if let Some(avg) = stats.avg_duration_secs {
                        println!("  mean duration: {:.1}s", avg);
                    }
                }
            }
        },
        Commands::Cancel { id } => {
            if orchestrator.get_job(&id).await?.is_none() {
                anyhow::bail!("No job with id: {}", id);
            }
            if orchestrator.cancel(&id).await? {
                println!("Canceled job {}", id);
            } else {
                println!("Job {} already finished", id);
            }
        }
        Commands::Cleanup { older_than_days } => {
            let days = older_than_days.unwrap_or(orchestrator.config().jobs.retention_days);
            let removed = orchestrator
                .jobs()
                .cleanup_finished(chrono::Duration::days(days))
                .await?;
            println!("Removed {} finished jobs older than {} days", removed, days);
        }
        Commands::Docs { status, limit } => {
            let docs = repository::list_documents(orchestrator.pool(), status, limit).await?;
            if json {
                print_json(&docs)?;
            } else {
                for doc in &docs {
                    println!("{}  {:<9} {}", doc.id, doc.status.as_str(), doc.uri);
                    if let Some(error) = &doc.error_message {
                        println!("    error: {}", error);
                    }
                }
            }
        }
        Commands::Stats => {
            let stats = repository::catalog_stats(orchestrator.pool()).await?;
            if json {
                print_json(&stats)?;
            } else {
                println!("Documents:  {} ({} pending, {} processed, {} failed)",
                    stats.documents, stats.pending, stats.processed, stats.failed);
                println!("Chunks:     {}", stats.chunks);
                println!("Summaries:  {}", stats.summaries);
                println!("Embeddings: {}", stats.embeddings);
                println!("Links:      {}", stats.links);
            }
        }
        Commands::Outbox { action } => {
            let outbox = OutboxPublisher::new(
                orchestrator.pool().clone(),
                orchestrator.config().outbox.topic.clone(),
            );
            match action {
                OutboxAction::Pending { limit } => {
                    let events = outbox.pending(limit).await?;
                    if json {
                        print_json(&events)?;
                    } else {
                        for event in &events {
                            println!("{}  {}  {}", event.id, event.topic, event.payload);
                        }
                    }
                }
                OutboxAction::Ack { id } => {
                    if outbox.mark_delivered(&id).await? {
                        println!("Delivered {}", id);
                    } else {
                        anyhow::bail!("No undelivered outbox event with id: {}", id);
                    }
                }
            }
        }
        Commands::Health => {
            let report = orchestrator.ready().await;
            if json {
                print_json(&report)?;
            } else {
                println!("database: {}", if report.database { "ok" } else { "unavailable" });
                for p in &report.providers {
                    println!(
                        "provider {}{}: {}",
                        p.name,
                        if p.primary { " (primary)" } else { "" },
                        if p.available { "available" } else { "unavailable" }
                    );
                }
                for h in &report.health {
                    match &h.detail {
                        Some(detail) if !h.healthy => {
                            println!("health {}: unhealthy ({})", h.provider, detail)
                        }
                        _ if !h.healthy => println!("health {}: unhealthy", h.provider),
                        _ => println!("health {}: ok, {} models", h.provider, h.models.len()),
                    }
                }
                println!("ready: {}", report.ready);
            }
            if !report.ready {
                anyhow::bail!("not ready");
            }
        }
        Commands::Serve => {
            server::run_server(orchestrator).await?;
        }
    }

    Ok(())
}
