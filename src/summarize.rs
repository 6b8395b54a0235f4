//! LLM-backed summaries.
//!
//! A [`Summarizer`] turns text into one of four summary shapes, each with its
//! own prompt and output token cap, and sends it through the
//! [`ProviderManager`] fallback chain.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use crate::error::PipelineError;
use crate::provider::{ProviderManager, TextRequest};

/// Sampling temperature for every summary; low for repeatable output.
const SUMMARY_TEMPERATURE: f32 = 0.1;
const MAX_KEYWORDS: usize = 15;

static KEYWORD_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,\n;]+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    /// One or two sentences.
    #[default]
    Brief,
    /// A paragraph-level digest.
    Detailed,
    /// A comma separated keyword list.
    Keywords,
    /// Main points as a bullet list.
    Bullet,
}

impl SummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryType::Brief => "brief",
            SummaryType::Detailed => "detailed",
            SummaryType::Keywords => "keywords",
            SummaryType::Bullet => "bullet",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        match self {
            SummaryType::Brief => 100,
            SummaryType::Detailed => 500,
            SummaryType::Keywords => 150,
            SummaryType::Bullet => 300,
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            SummaryType::Brief => {
                "You are an expert at summarizing text. Summarize the key point of the \
                 given text in one or two concise sentences. Do not add information that \
                 is not in the text."
            }
            SummaryType::Detailed => {
                "You are an expert at summarizing text. Write a detailed summary of the \
                 main content of the given text, keeping its structure and the important \
                 facts, names and figures."
            }
            SummaryType::Keywords => {
                "You are an expert at keyword extraction. List the most important \
                 keywords and key phrases of the given text, separated by commas, most \
                 important first. Output only the list."
            }
            SummaryType::Bullet => {
                "You are an expert at organizing text. Summarize the main points of the \
                 given text as a bullet list, one point per line, each starting with '- '."
            }
        }
    }
}

impl fmt::Display for SummaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "brief" => Ok(SummaryType::Brief),
            "detailed" => Ok(SummaryType::Detailed),
            "keywords" => Ok(SummaryType::Keywords),
            "bullet" | "bullets" => Ok(SummaryType::Bullet),
            other => anyhow::bail!(
                "Unknown summary type: '{}'. Must be brief, detailed, keywords, or bullet.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SummaryRequest {
    pub text: String,
    pub summary_type: SummaryType,
    /// Approximate upper bound on summary length, in characters.
    pub max_length: Option<usize>,
    /// Response language; the model's default when `None`.
    pub language: Option<String>,
    /// Extra context prepended to the text, e.g. the document title.
    pub context: Option<String>,
}

impl SummaryRequest {
    pub fn new(text: impl Into<String>, summary_type: SummaryType) -> Self {
        Self {
            text: text.into(),
            summary_type,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResult {
    pub summary: String,
    pub summary_type: SummaryType,
    pub model: String,
    pub provider: String,
    pub original_length: usize,
    pub summary_length: usize,
    pub compression_ratio: f64,
    /// Parsed keyword list, for [`SummaryType::Keywords`] only.
    pub keywords: Option<Vec<String>>,
}

pub struct Summarizer {
    providers: Arc<ProviderManager>,
}

impl Summarizer {
    pub fn new(providers: Arc<ProviderManager>) -> Self {
        Self { providers }
    }

    pub async fn summarize(
        &self,
        request: &SummaryRequest,
        preferred: Option<&str>,
    ) -> Result<SummaryResult> {
        if request.text.trim().is_empty() {
            return Err(PipelineError::validation("cannot summarize empty text").into());
        }

        let (system, prompt) = build_prompt(request);
        let text_request = TextRequest {
            prompt,
            system: Some(system),
            model: None,
            max_tokens: Some(max_tokens_for(request)),
            temperature: Some(SUMMARY_TEMPERATURE),
        };

        let response = self
            .providers
            .generate_text_with_fallback(&text_request, preferred)
            .await?;

        let summary = response.text.trim().to_string();
        let original_length = request.text.chars().count();
        let summary_length = summary.chars().count();
        let keywords = (request.summary_type == SummaryType::Keywords)
            .then(|| extract_keywords(&summary));

        Ok(SummaryResult {
            compression_ratio: if original_length > 0 {
                summary_length as f64 / original_length as f64
            } else {
                0.0
            },
            summary,
            summary_type: request.summary_type,
            model: response.model,
            provider: response.provider,
            original_length,
            summary_length,
            keywords,
        })
    }
}

/// Output cap for the request, tightened by `max_length` at roughly 1.5
/// tokens per character.
pub fn max_tokens_for(request: &SummaryRequest) -> u32 {
    let base = request.summary_type.max_tokens();
    match request.max_length {
        Some(len) => base.min(((len as f64) * 1.5) as u32).max(1),
        None => base,
    }
}

/// Returns `(system, user)` prompts.
pub fn build_prompt(request: &SummaryRequest) -> (String, String) {
    let mut system = request.summary_type.system_prompt().to_string();
    if let Some(language) = &request.language {
        system.push_str(&format!("\n\nRespond in {}.", language));
    }
    if let Some(max_length) = request.max_length {
        system.push_str(&format!(
            "\n\nKeep the response under {} characters.",
            max_length
        ));
    }

    let mut user = format!("Summarize the following text:\n\n{}", request.text);
    if let Some(context) = &request.context {
        user = format!("Context: {}\n\n{}", context, user);
    }

    (system, user)
}

/// Split a keyword answer on commas, semicolons and newlines, stripping list
/// markers and dropping single characters.
pub fn extract_keywords(text: &str) -> Vec<String> {
    KEYWORD_SPLIT
        .split(text)
        .map(|k| k.trim().trim_matches(|c| matches!(c, '-' | '.' | '•' | '*')).trim())
        .filter(|k| k.chars().count() > 1)
        .take(MAX_KEYWORDS)
        .map(|k| k.to_string())
        .collect()
}
