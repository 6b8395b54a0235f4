//! Configuration parsing and validation.
//!
//! docflow is configured by a TOML file (conventionally
//! `config/docflow.toml`) followed by a small set of environment overrides.
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! [db]
//! path = "./data/docflow.sqlite"
//!
//! [pipeline]
//! batch_size = 10
//! max_concurrent = 5
//! chunking_strategy = "sentence"
//!
//! [chunking]
//! max_tokens = 512
//! overlap_tokens = 50
//! min_tokens = 50
//!
//! [providers]
//! primary = "openai"
//! fallbacks = ["ollama"]
//! ```
//!
//! Environment variables win over the file. List-valued variables
//! (`DOCFLOW_FILE_EXTENSIONS`, `DOCFLOW_IGNORE_PATTERNS`) are comma
//! separated.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::ChunkingStrategy;
use crate::summarize::SummaryType;

/// Provider names the manager knows how to build.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "ollama"];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub linking: LinkingConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docflow.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub chunking_strategy: ChunkingStrategy,
    #[serde(default = "default_true")]
    pub generate_summaries: bool,
    #[serde(default = "default_true")]
    pub generate_embeddings: bool,
    #[serde(default)]
    pub generate_links: bool,
    #[serde(default)]
    pub summary_type: SummaryType,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            chunking_strategy: ChunkingStrategy::default(),
            generate_summaries: true,
            generate_embeddings: true,
            generate_links: false,
            summary_type: SummaryType::default(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_max_concurrent() -> usize {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            min_tokens: default_min_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}
fn default_min_tokens() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    /// Allowed extensions, compared case-insensitively. A leading dot is optional.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// A path segment containing any of these as a substring is skipped.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    /// Globs matched against the root-relative path.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            ignore_patterns: default_ignore_patterns(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_extensions() -> Vec<String> {
    [".md", ".mdx", ".txt", ".rst"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ignore_patterns() -> Vec<String> {
    [".git", "node_modules", "__pycache__", ".venv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NormalizeConfig {
    /// Re-append parsed front-matter as a `--- Metadata ---` block.
    #[serde(default)]
    pub preserve_frontmatter: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Requests per batch-embedding group.
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallbacks: Vec::new(),
            embedding_batch_size: default_embedding_batch_size(),
            openai: OpenAiConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl ProvidersConfig {
    /// Primary first, then fallbacks in declaration order, without duplicates.
    pub fn ordered_names(&self) -> Vec<String> {
        let mut names = vec![self.primary.clone()];
        for name in &self.fallbacks {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

fn default_primary() -> String {
    "openai".to_string()
}
fn default_embedding_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    /// Falls back to `OPENAI_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default = "default_openai_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_openai_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_openai_retries")]
    pub max_retries: u32,
    #[serde(default = "default_openai_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_url(),
            chat_model: default_openai_chat_model(),
            embedding_model: default_openai_embedding_model(),
            max_retries: default_openai_retries(),
            base_delay_ms: default_openai_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_openai_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}
fn default_openai_retries() -> u32 {
    3
}
fn default_openai_base_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_host")]
    pub host: String,
    #[serde(default = "default_ollama_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_ollama_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_ollama_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ollama_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: default_ollama_host(),
            chat_model: default_ollama_chat_model(),
            embedding_model: default_ollama_embedding_model(),
            max_retries: default_ollama_retries(),
            base_delay_ms: default_ollama_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_chat_model() -> String {
    "llama2".to_string()
}
fn default_ollama_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_ollama_retries() -> u32 {
    2
}
fn default_ollama_base_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkingConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            threshold: default_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_threshold() -> f32 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: default_topic(),
        }
    }
}

fn default_topic() -> String {
    "document.processed".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// Finished jobs older than this are removed by `docflow cleanup`.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> i64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Parse a TOML document without touching the environment or validating.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Taking the lookup as a parameter keeps tests away from process-global
    /// state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DOCFLOW_DB_PATH") {
            self.db.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DOCFLOW_MAX_CONCURRENT") {
            self.pipeline.max_concurrent = parse_env("DOCFLOW_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_BATCH_SIZE") {
            self.pipeline.batch_size = parse_env("DOCFLOW_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_CHUNK_MAX_TOKENS") {
            self.chunking.max_tokens = parse_env("DOCFLOW_CHUNK_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_CHUNK_OVERLAP_TOKENS") {
            self.chunking.overlap_tokens = parse_env("DOCFLOW_CHUNK_OVERLAP_TOKENS", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_CHUNK_MIN_TOKENS") {
            self.chunking.min_tokens = parse_env("DOCFLOW_CHUNK_MIN_TOKENS", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_FILE_EXTENSIONS") {
            self.scanner.extensions = split_list(&v);
        }
        if let Some(v) = lookup("DOCFLOW_IGNORE_PATTERNS") {
            self.scanner.ignore_patterns = split_list(&v);
        }
        if let Some(v) = lookup("DOCFLOW_PRIMARY_PROVIDER") {
            self.providers.primary = v.trim().to_string();
        }
        if let Some(v) = lookup("DOCFLOW_RETRY_MAX") {
            let retries: u32 = parse_env("DOCFLOW_RETRY_MAX", &v)?;
            self.providers.openai.max_retries = retries;
            self.providers.ollama.max_retries = retries;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            if self.providers.openai.api_key.is_none() && !v.trim().is_empty() {
                self.providers.openai.api_key = Some(v);
            }
        }
        if let Some(v) = lookup("OLLAMA_HOST") {
            self.providers.ollama.host = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            anyhow::bail!(
                "chunking.overlap_tokens ({}) must be < chunking.max_tokens ({})",
                self.chunking.overlap_tokens,
                self.chunking.max_tokens
            );
        }
        if self.chunking.min_tokens > self.chunking.max_tokens {
            anyhow::bail!(
                "chunking.min_tokens ({}) must be <= chunking.max_tokens ({})",
                self.chunking.min_tokens,
                self.chunking.max_tokens
            );
        }

        if self.pipeline.batch_size == 0 {
            anyhow::bail!("pipeline.batch_size must be > 0");
        }
        if self.pipeline.max_concurrent == 0 {
            anyhow::bail!("pipeline.max_concurrent must be > 0");
        }

        for name in self.providers.ordered_names() {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                anyhow::bail!(
                    "Unknown provider: '{}'. Must be one of: {}.",
                    name,
                    KNOWN_PROVIDERS.join(", ")
                );
            }
        }
        if self.providers.embedding_batch_size == 0 {
            anyhow::bail!("providers.embedding_batch_size must be > 0");
        }

        if !(0.0..=1.0).contains(&self.linking.threshold) {
            anyhow::bail!("linking.threshold must be in [0.0, 1.0]");
        }

        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, value, e))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Load, override from the process environment, and validate. A missing
/// file yields the defaults; an unreadable or invalid one is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Config::from_toml_str(&content)?
    } else {
        Config::default()
    };
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;

    Ok(config)
}
