//! Chunk embedding and vector helpers.
//!
//! The [`Embedder`] sends every chunk of a document through
//! [`ProviderManager::batch_embed`] and stores each vector as a
//! little-endian `f32` BLOB keyed by `(chunk_id, provider, model)`.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Chunk, Embedding};
use crate::provider::{EmbeddingRequest, ProviderManager};
use crate::repository;

#[derive(Debug, Clone, Default)]
pub struct EmbedOutcome {
    pub embedded: usize,
    pub failed: usize,
    /// `(provider, model)` of the stored vectors, if any were stored.
    pub provider_model: Option<(String, String)>,
}

pub struct Embedder {
    pool: SqlitePool,
    providers: Arc<ProviderManager>,
}

impl Embedder {
    pub fn new(pool: SqlitePool, providers: Arc<ProviderManager>) -> Self {
        Self { pool, providers }
    }

    /// Embed and store every chunk. Successful vectors are persisted even when
    /// some groups fail; the failure is then reported as an error.
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        preferred: Option<&str>,
    ) -> Result<EmbedOutcome> {
        if chunks.is_empty() {
            return Ok(EmbedOutcome::default());
        }

        let requests: Vec<EmbeddingRequest> = chunks
            .iter()
            .map(|c| EmbeddingRequest::new(c.text.clone()))
            .collect();
        let batch = self.providers.batch_embed(&requests, preferred).await;

        let mut outcome = EmbedOutcome::default();
        for (chunk, result) in chunks.iter().zip(batch.results) {
            let Some(response) = result else {
                outcome.failed += 1;
                continue;
            };
            let embedding = Embedding {
                id: Uuid::new_v4().to_string(),
                chunk_id: chunk.id.clone(),
                provider: response.provider,
                model: response.model,
                dim: response.vector.len() as i64,
                vector: response.vector,
            };
            repository::upsert_embedding(&self.pool, &embedding).await?;
            outcome.provider_model = Some((embedding.provider, embedding.model));
            outcome.embedded += 1;
        }

        debug!(
            embedded = outcome.embedded,
            failed = outcome.failed,
            "stored chunk embeddings"
        );

        if let Some(failure) = batch.failures.first() {
            anyhow::bail!(
                "embedding failed for {} of {} chunks: {}",
                outcome.failed,
                chunks.len(),
                failure.error
            );
        }

        Ok(outcome)
    }
}

/// Encode a float vector as a little-endian BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero, or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
