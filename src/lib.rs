//! # docflow
//!
//! Incremental document ingestion. docflow detects which files in a tree
//! are new or changed, then runs each pending document through a pipeline
//! that normalizes it, splits it into token-bounded chunks and asks an LLM
//! provider for a summary and chunk embeddings. Everything lands in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────────┐   ┌──────────┐
//! │ Scanner  │──▶│ Orchestrator (batches, Semaphore) │──▶│  SQLite  │
//! │ hash/diff│   │ normalize → chunk → sum → embed  │   │ catalog  │
//! └──────────┘   └───────────────┬──────────────────┘   └────┬─────┘
//!                                │                           │
//!                       ┌────────▼────────┐      ┌───────────┤
//!                       │ ProviderManager │      ▼           ▼
//!                       │ retry/fallback  │ ┌─────────┐ ┌──────────┐
//!                       │ OpenAI, Ollama  │ │   CLI   │ │   HTTP   │
//!                       └─────────────────┘ └─────────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`models`] | Catalog row types and state enums |
//! | [`scanner`] | Content-hash change detection |
//! | [`normalize`] | Markup and front-matter stripping |
//! | [`chunk`] | Token, sentence and paragraph chunking |
//! | [`provider`] | Provider trait, OpenAI/Ollama, retry and fallback |
//! | [`summarize`] | Summary prompts |
//! | [`embed`] | Chunk embeddings and vector helpers |
//! | [`links`] | Cosine-similarity chunk links |
//! | [`jobs`] | Job state machine |
//! | [`orchestrator`] | Batch execution of the pipeline |
//! | [`outbox`] | Durable processed-document events |
//! | [`repository`] | Catalog queries |
//! | [`server`] | HTTP control API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embed;
pub mod error;
pub mod jobs;
pub mod links;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod outbox;
pub mod provider;
pub mod repository;
pub mod scanner;
pub mod server;
pub mod summarize;
