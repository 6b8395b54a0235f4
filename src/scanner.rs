//! Incremental change detection over a directory tree.
//!
//! A scan walks the tree, hashes every candidate file and diffs the result
//! against the stored catalog. New files are inserted as `pending`, changed
//! files are reset to `pending`, and catalog entries inside the walked scope
//! whose file disappeared are deleted. All catalog writes of one scan commit
//! in a single transaction.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use crate::config::ScannerConfig;
use crate::error::PipelineError;
use crate::models::{Document, DocumentStatus, SourceType};
use crate::normalize;
use crate::repository;

const HASH_BUFFER_SIZE: usize = 8 * 1024;
/// Front-matter is only looked for this far into a file.
const FRONTMATTER_PEEK_BYTES: usize = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    pub total: u64,
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub deleted: u64,
    /// Files tracked with a fallback hash because their contents could not be read.
    pub hash_failures: u64,
    pub errors: Vec<ScanError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

/// One file as seen on disk.
#[derive(Debug)]
struct ScannedFile {
    uri: String,
    mtime: i64,
    size: i64,
    content_hash: String,
    title: Option<String>,
    metadata_json: String,
}

#[derive(Debug, Default)]
struct Walk {
    files: Vec<ScannedFile>,
    /// URIs that exist on disk, including files that could not be stat'ed.
    seen: HashSet<String>,
    /// Entries the walk could not descend into or read. Catalog URIs at or
    /// below these paths are kept, since their files were never observed.
    unreadable: Vec<PathBuf>,
    hash_failures: u64,
    errors: Vec<ScanError>,
}

impl Walk {
    /// Whether a catalog URI missing from this walk may be deleted.
    fn is_gone(&self, root: &Path, uri: &str, recursive: bool) -> bool {
        let path = Path::new(uri);
        !self.seen.contains(uri)
            && in_scope(root, path, recursive)
            && !self.unreadable.iter().any(|dir| path.starts_with(dir))
    }
}

pub struct Scanner {
    pool: SqlitePool,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(pool: SqlitePool, config: ScannerConfig) -> Self {
        Self { pool, config }
    }

    pub async fn scan(&self, root: &Path, recursive: bool) -> Result<ScanResult> {
        let root = validate_root(root)?;
        info!(root = %root.display(), recursive, "scanning");

        let mut walk = {
            let root = root.clone();
            let config = self.config.clone();
            tokio::task::spawn_blocking(move || walk_tree(&root, recursive, &config)).await??
        };
        for error in &walk.errors {
            warn!(path = %error.path, error = %error.message, "scan error");
        }

        let catalog: HashMap<String, (String, String)> = repository::file_document_index(&self.pool)
            .await?
            .into_iter()
            .map(|(id, uri, hash)| (uri, (id, hash)))
            .collect();

        let mut result = ScanResult {
            total: walk.files.len() as u64,
            hash_failures: walk.hash_failures,
            errors: std::mem::take(&mut walk.errors),
            ..Default::default()
        };
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        for file in &walk.files {
            match catalog.get(&file.uri) {
                None => {
                    let doc = Document {
                        id: Uuid::new_v4().to_string(),
                        source_type: SourceType::File,
                        uri: file.uri.clone(),
                        path: Some(file.uri.clone()),
                        mtime: file.mtime,
                        size: file.size,
                        content_hash: file.content_hash.clone(),
                        title: file.title.clone(),
                        metadata_json: file.metadata_json.clone(),
                        status: DocumentStatus::Pending,
                        error_message: None,
                        created_at: now,
                        updated_at: now,
                    };
                    repository::insert_document(&mut tx, &doc).await?;
                    debug!(uri = %file.uri, "new document");
                    result.new += 1;
                }
                Some((id, hash)) if *hash != file.content_hash => {
                    repository::mark_changed(
                        &mut tx,
                        id,
                        &file.content_hash,
                        file.mtime,
                        file.size,
                        &file.metadata_json,
                    )
                    .await?;
                    debug!(uri = %file.uri, "changed document");
                    result.changed += 1;
                }
                Some(_) => result.unchanged += 1,
            }
        }

        for (uri, (id, _)) in &catalog {
            if !walk.is_gone(&root, uri, recursive) {
                continue;
            }
            repository::delete_document(&mut tx, id).await?;
            debug!(uri = %uri, "deleted document");
            result.deleted += 1;
        }
        tx.commit().await?;

        info!(
            total = result.total,
            new = result.new,
            changed = result.changed,
            unchanged = result.unchanged,
            deleted = result.deleted,
            errors = result.errors.len(),
            "scan complete"
        );
        Ok(result)
    }
}

fn validate_root(root: &Path) -> Result<PathBuf> {
    if !root.exists() {
        return Err(PipelineError::validation(format!(
            "Scan root does not exist: {}",
            root.display()
        ))
        .into());
    }
    if !root.is_dir() {
        return Err(PipelineError::validation(format!(
            "Scan root is not a directory: {}",
            root.display()
        ))
        .into());
    }
    Ok(root.canonicalize()?)
}

/// Whether a catalog URI belongs to the tree a scan of `root` covers.
fn in_scope(root: &Path, uri: &Path, recursive: bool) -> bool {
    match uri.strip_prefix(root) {
        Ok(relative) if recursive => relative.components().next().is_some(),
        Ok(relative) => relative.components().count() == 1,
        Err(_) => false,
    }
}

fn walk_tree(root: &Path, recursive: bool, config: &ScannerConfig) -> Result<Walk> {
    let excludes = build_globset(&config.exclude_globs)?;
    let extensions: HashSet<String> = config
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut walk = Walk::default();
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(e, &config.ignore_patterns));
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                walk.errors.push(ScanError {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
                walk.unreadable.push(path);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !has_allowed_extension(path, &extensions) {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        if excludes.is_match(relative) {
            continue;
        }

        let uri = path.display().to_string();
        walk.seen.insert(uri.clone());
        match scan_file(path, uri) {
            Ok((file, error)) => {
                if let Some(error) = error {
                    walk.hash_failures += 1;
                    walk.errors.push(error);
                }
                walk.files.push(file);
            }
            Err(error) => walk.errors.push(error),
        }
    }

    walk.files.sort_by(|a, b| a.uri.cmp(&b.uri));
    Ok(walk)
}

/// A hidden entry, or one whose name contains an ignore pattern.
fn is_ignored(entry: &DirEntry, ignore_patterns: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || ignore_patterns.iter().any(|p| !p.is_empty() && name.contains(p.as_str()))
}

fn has_allowed_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .map(|e| extensions.contains(&e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or(false)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Stat and hash one file. A read failure still yields a trackable entry
/// (hashed from path and mtime) together with the error; a stat failure
/// yields only the error.
fn scan_file(path: &Path, uri: String) -> std::result::Result<(ScannedFile, Option<ScanError>), ScanError> {
    let metadata = std::fs::metadata(path).map_err(|e| ScanError {
        path: uri.clone(),
        message: format!("Failed to read metadata: {}", e),
    })?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let (content_hash, error) = match hash_file(path) {
        Ok(hash) => (hash, None),
        Err(e) => (
            fallback_hash(&uri, mtime),
            Some(ScanError {
                path: uri.clone(),
                message: format!("Failed to hash file: {}", e),
            }),
        ),
    };

    let title = path.file_stem().map(|s| s.to_string_lossy().to_string());
    let metadata_json = serde_json::Value::Object(read_frontmatter(path)).to_string();

    Ok((
        ScannedFile {
            uri,
            mtime,
            size: metadata.len() as i64,
            content_hash,
            title,
            metadata_json,
        },
        error,
    ))
}

/// Streaming SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn fallback_hash(uri: &str, mtime: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    hasher.update(mtime.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Front-matter of a Markdown file, read from its first bytes only.
fn read_frontmatter(path: &Path) -> serde_json::Map<String, serde_json::Value> {
    let is_markdown = path
        .extension()
        .map(|e| matches!(e.to_string_lossy().to_ascii_lowercase().as_str(), "md" | "mdx"))
        .unwrap_or(false);
    if !is_markdown {
        return serde_json::Map::new();
    }

    let mut head = Vec::with_capacity(FRONTMATTER_PEEK_BYTES);
    let read = std::fs::File::open(path)
        .and_then(|f| f.take(FRONTMATTER_PEEK_BYTES as u64).read_to_end(&mut head));
    if read.is_err() {
        return serde_json::Map::new();
    }
    normalize::parse_frontmatter(&String::from_utf8_lossy(&head))
}
