//! Core data models used throughout docflow.
//!
//! These types mirror the rows of the catalog tables (`documents`, `chunks`,
//! `summaries`, `embeddings`, `links`, `jobs`). Identifiers are UUID strings
//! and timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => anyhow::bail!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    ),
                }
            }
        }
    };
}

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Web,
}

string_enum!(SourceType { File => "file", Web => "web" });

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processed,
    Failed,
}

string_enum!(DocumentStatus {
    Pending => "pending",
    Processed => "processed",
    Failed => "failed",
});

/// Kind of long-running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scan,
    Process,
    Crawl,
}

string_enum!(JobKind {
    Scan => "scan",
    Process => "process",
    Crawl => "crawl",
});

/// Lifecycle state of a job.
///
/// ```text
/// queued ──▶ running ──▶ succeeded
///   │           ├──────▶ failed
///   │           └──────▶ canceled
///   └──▶ failed | canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

string_enum!(JobState {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// States from which a transition into `self` is legal.
    ///
    /// `running -> running` is allowed so a resumed job keeps its original
    /// `started_at`.
    pub fn legal_sources(&self) -> &'static [JobState] {
        match self {
            JobState::Queued => &[],
            JobState::Running => &[JobState::Queued, JobState::Running],
            JobState::Succeeded => &[JobState::Running],
            JobState::Failed | JobState::Canceled => &[JobState::Queued, JobState::Running],
        }
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        next.legal_sources().contains(self)
    }
}

/// How two chunks came to be linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Explicit,
    Semantic,
}

string_enum!(LinkType {
    Explicit => "explicit",
    Semantic => "semantic",
});

/// A tracked source unit stored in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub source_type: SourceType,
    pub uri: String,
    pub path: Option<String>,
    pub mtime: i64,
    pub size: i64,
    pub content_hash: String,
    pub title: Option<String>,
    pub metadata_json: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored slice of a document's normalized text.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub token_len: i64,
    pub hash: String,
}

/// A generated summary. `chunk_id == None` means document-level.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub id: String,
    pub document_id: String,
    pub chunk_id: Option<String>,
    pub model: String,
    pub text: String,
    pub created_at: i64,
}

/// An embedding vector for one chunk under one provider/model pair.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub id: String,
    pub chunk_id: String,
    pub provider: String,
    pub model: String,
    pub dim: i64,
    pub vector: Vec<f32>,
}

/// A directed edge between two chunks.
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub id: String,
    pub src_chunk_id: String,
    pub dst_chunk_id: String,
    pub score: f64,
    pub link_type: LinkType,
}

/// Persisted record of one scan/process run.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub params: serde_json::Value,
    pub state: JobState,
    pub progress: f64,
    pub current: i64,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Job {
    /// Wall-clock seconds between start and finish (or now, if still running).
    pub fn duration_secs(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self
            .finished_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        Some(end - started)
    }
}
