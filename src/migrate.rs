//! Schema creation. Every statement is idempotent, so `docflow init` can be
//! run any number of times.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_type TEXT NOT NULL DEFAULT 'file',
        uri TEXT NOT NULL UNIQUE,
        path TEXT,
        mtime INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL DEFAULT 0,
        content_hash TEXT NOT NULL,
        title TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        text TEXT NOT NULL,
        token_len INTEGER NOT NULL,
        hash TEXT NOT NULL,
        UNIQUE(document_id, ordinal),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(hash)",
    r#"
    CREATE TABLE IF NOT EXISTS summaries (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        chunk_id TEXT,
        model TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
        FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_summaries_document ON summaries(document_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        id TEXT PRIMARY KEY,
        chunk_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        dim INTEGER NOT NULL,
        vector BLOB NOT NULL,
        UNIQUE(chunk_id, provider, model),
        FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS links (
        id TEXT PRIMARY KEY,
        src_chunk_id TEXT NOT NULL,
        dst_chunk_id TEXT NOT NULL,
        score REAL NOT NULL,
        link_type TEXT NOT NULL,
        UNIQUE(src_chunk_id, dst_chunk_id, link_type),
        FOREIGN KEY (src_chunk_id) REFERENCES chunks(id) ON DELETE CASCADE,
        FOREIGN KEY (dst_chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        params_json TEXT NOT NULL DEFAULT '{}',
        state TEXT NOT NULL,
        progress REAL NOT NULL DEFAULT 0,
        current INTEGER NOT NULL DEFAULT 0,
        total INTEGER NOT NULL DEFAULT 0,
        succeeded INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id TEXT PRIMARY KEY,
        topic TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        delivered_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(delivered_at, created_at)",
];

/// Create every table and index on an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
