//! Catalog reads and writes.
//!
//! Each function is one statement or one transaction. Functions taking a
//! `&mut SqliteConnection` run inside a caller-owned transaction (the scanner
//! commits a whole scan at once); the rest take the pool.

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::chunk::TextChunk;
use crate::embed::{blob_to_vec, vec_to_blob};
use crate::error::PipelineError;
use crate::models::{Chunk, Document, DocumentStatus, Embedding, Link, Summary};

const DOCUMENT_COLUMNS: &str = "id, source_type, uri, path, mtime, size, content_hash, title, \
     metadata_json, status, error_message, created_at, updated_at";

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        source_type: source_type.parse()?,
        uri: row.get("uri"),
        path: row.get("path"),
        mtime: row.get("mtime"),
        size: row.get("size"),
        content_hash: row.get("content_hash"),
        title: row.get("title"),
        metadata_json: row.get("metadata_json"),
        status: status.parse()?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        token_len: row.get("token_len"),
        hash: row.get("hash"),
    }
}

// ============ Documents ============

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(document_from_row).transpose()
}

pub async fn get_document_by_uri(pool: &SqlitePool, uri: &str) -> Result<Option<Document>> {
    let row = sqlx::query(&format!("SELECT {} FROM documents WHERE uri = ?", DOCUMENT_COLUMNS))
        .bind(uri)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(document_from_row).transpose()
}

/// `(id, uri, content_hash)` of every file-backed document.
pub async fn file_document_index(pool: &SqlitePool) -> Result<Vec<(String, String, String)>> {
    let rows = sqlx::query(
        "SELECT id, uri, content_hash FROM documents WHERE source_type = 'file'",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("id"), r.get("uri"), r.get("content_hash")))
        .collect())
}

/// Documents awaiting processing, oldest first. With `uri_prefix`, only
/// documents whose URI starts with it.
pub async fn pending_documents(
    pool: &SqlitePool,
    uri_prefix: Option<&str>,
) -> Result<Vec<Document>> {
    let rows = match uri_prefix {
        Some(prefix) => {
            sqlx::query(&format!(
                "SELECT {} FROM documents WHERE status = 'pending' AND substr(uri, 1, length(?1)) = ?1 \
                 ORDER BY created_at, uri",
                DOCUMENT_COLUMNS
            ))
            .bind(prefix)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM documents WHERE status = 'pending' ORDER BY created_at, uri",
                DOCUMENT_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(document_from_row).collect()
}

pub async fn list_documents(
    pool: &SqlitePool,
    status: Option<DocumentStatus>,
    limit: i64,
) -> Result<Vec<Document>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE (?1 IS NULL OR status = ?1) ORDER BY updated_at DESC, uri LIMIT ?2",
        DOCUMENT_COLUMNS
    ))
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(document_from_row).collect()
}

pub async fn insert_document(conn: &mut SqliteConnection, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, source_type, uri, path, mtime, size, content_hash, title,
                               metadata_json, status, error_message, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(doc.source_type.as_str())
    .bind(&doc.uri)
    .bind(&doc.path)
    .bind(doc.mtime)
    .bind(doc.size)
    .bind(&doc.content_hash)
    .bind(&doc.title)
    .bind(&doc.metadata_json)
    .bind(doc.status.as_str())
    .bind(&doc.error_message)
    .bind(doc.created_at)
    .bind(doc.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record new content for a changed document and queue it for reprocessing.
pub async fn mark_changed(
    conn: &mut SqliteConnection,
    id: &str,
    content_hash: &str,
    mtime: i64,
    size: i64,
    metadata_json: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents
        SET content_hash = ?, mtime = ?, size = ?, metadata_json = ?,
            status = 'pending', error_message = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(content_hash)
    .bind(mtime)
    .bind(size)
    .bind(metadata_json)
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delete a document. Chunks, summaries, embeddings and links cascade.
pub async fn delete_document(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_processed(
    pool: &SqlitePool,
    id: &str,
    title: Option<&str>,
    metadata_json: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'processed', error_message = NULL,
            title = COALESCE(?, title), metadata_json = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(title)
    .bind(metadata_json)
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await
    .map_err(PipelineError::Storage)?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE documents SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStats {
    pub documents: i64,
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
    pub chunks: i64,
    pub summaries: i64,
    pub embeddings: i64,
    pub links: i64,
}

pub async fn catalog_stats(pool: &SqlitePool) -> Result<CatalogStats> {
    let mut stats = CatalogStats::default();
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
        .fetch_all(pool)
        .await?;
    for row in &rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        stats.documents += n;
        match status.as_str() {
            "pending" => stats.pending = n,
            "processed" => stats.processed = n,
            "failed" => stats.failed = n,
            _ => {}
        }
    }
    stats.chunks = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    stats.summaries = sqlx::query_scalar("SELECT COUNT(*) FROM summaries")
        .fetch_one(pool)
        .await?;
    stats.embeddings = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await?;
    stats.links = sqlx::query_scalar("SELECT COUNT(*) FROM links")
        .fetch_one(pool)
        .await?;
    Ok(stats)
}

// ============ Chunks ============

/// Replace a document's chunk set in one transaction.
///
/// The old chunks go first; their summaries, embeddings and links cascade.
/// A failed write rolls back and surfaces as [`PipelineError::Storage`].
pub async fn replace_chunks(
    pool: &SqlitePool,
    document_id: &str,
    chunks: &[TextChunk],
) -> Result<Vec<Chunk>> {
    let stored: Vec<Chunk> = chunks
        .iter()
        .map(|c| Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            ordinal: c.ordinal as i64,
            text: c.text.clone(),
            token_len: c.token_count as i64,
            hash: c.hash.clone(),
        })
        .collect();

    write_chunks(pool, document_id, &stored)
        .await
        .map_err(PipelineError::Storage)?;
    Ok(stored)
}

async fn write_chunks(
    pool: &SqlitePool,
    document_id: &str,
    chunks: &[Chunk],
) -> std::result::Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, ordinal, text, token_len, hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.ordinal)
        .bind(&chunk.text)
        .bind(chunk.token_len)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

pub async fn chunks_for_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        "SELECT id, document_id, ordinal, text, token_len, hash FROM chunks WHERE document_id = ? ORDER BY ordinal",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

// ============ Summaries ============

pub async fn insert_summary(pool: &SqlitePool, summary: &Summary) -> Result<()> {
    sqlx::query(
        "INSERT INTO summaries (id, document_id, chunk_id, model, text, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&summary.id)
    .bind(&summary.document_id)
    .bind(&summary.chunk_id)
    .bind(&summary.model)
    .bind(&summary.text)
    .bind(summary.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// The most recent document-level summary.
pub async fn latest_summary(pool: &SqlitePool, document_id: &str) -> Result<Option<Summary>> {
    let row = sqlx::query(
        r#"
        SELECT id, document_id, chunk_id, model, text, created_at FROM summaries
        WHERE document_id = ? AND chunk_id IS NULL
        ORDER BY created_at DESC, rowid DESC LIMIT 1
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| Summary {
        id: r.get("id"),
        document_id: r.get("document_id"),
        chunk_id: r.get("chunk_id"),
        model: r.get("model"),
        text: r.get("text"),
        created_at: r.get("created_at"),
    }))
}

// ============ Embeddings ============

/// Insert or overwrite the vector for `(chunk_id, provider, model)`.
pub async fn upsert_embedding(pool: &SqlitePool, embedding: &Embedding) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embeddings (id, chunk_id, provider, model, dim, vector)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id, provider, model) DO UPDATE SET
            dim = excluded.dim,
            vector = excluded.vector
        "#,
    )
    .bind(&embedding.id)
    .bind(&embedding.chunk_id)
    .bind(&embedding.provider)
    .bind(&embedding.model)
    .bind(embedding.dim)
    .bind(vec_to_blob(&embedding.vector))
    .execute(pool)
    .await?;
    Ok(())
}

/// All embeddings for one document.
pub async fn embeddings_for_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<Embedding>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id, e.chunk_id, e.provider, e.model, e.dim, e.vector
        FROM embeddings e JOIN chunks c ON c.id = e.chunk_id
        WHERE c.document_id = ?
        ORDER BY c.ordinal
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(embedding_from_row).collect())
}

/// Every stored embedding produced by `provider`/`model`.
pub async fn embeddings_for_model(
    pool: &SqlitePool,
    provider: &str,
    model: &str,
) -> Result<Vec<Embedding>> {
    let rows = sqlx::query(
        "SELECT id, chunk_id, provider, model, dim, vector FROM embeddings WHERE provider = ? AND model = ?",
    )
    .bind(provider)
    .bind(model)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(embedding_from_row).collect())
}

fn embedding_from_row(row: &SqliteRow) -> Embedding {
    let blob: Vec<u8> = row.get("vector");
    Embedding {
        id: row.get("id"),
        chunk_id: row.get("chunk_id"),
        provider: row.get("provider"),
        model: row.get("model"),
        dim: row.get("dim"),
        vector: blob_to_vec(&blob),
    }
}

// ============ Links ============

/// Insert or rescore the link for `(src, dst, link_type)`.
pub async fn upsert_link(pool: &SqlitePool, link: &Link) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO links (id, src_chunk_id, dst_chunk_id, score, link_type)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(src_chunk_id, dst_chunk_id, link_type) DO UPDATE SET
            score = excluded.score
        "#,
    )
    .bind(&link.id)
    .bind(&link.src_chunk_id)
    .bind(&link.dst_chunk_id)
    .bind(link.score)
    .bind(link.link_type.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn links_from_chunk(pool: &SqlitePool, chunk_id: &str) -> Result<Vec<Link>> {
    let rows = sqlx::query(
        "SELECT id, src_chunk_id, dst_chunk_id, score, link_type FROM links WHERE src_chunk_id = ? ORDER BY score DESC",
    )
    .bind(chunk_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| -> Result<Link> {
            let link_type: String = r.get("link_type");
            Ok(Link {
                id: r.get("id"),
                src_chunk_id: r.get("src_chunk_id"),
                dst_chunk_id: r.get("dst_chunk_id"),
                score: r.get("score"),
                link_type: link_type.parse()?,
            })
        })
        .collect()
}
