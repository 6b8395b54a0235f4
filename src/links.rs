//! Semantic links between chunks.
//!
//! Each embedded chunk of a document is compared with every other stored
//! embedding of the same provider and model. The best `top_k` matches at or
//! above `threshold` become `semantic` links. Similarity is computed in
//! process; there is no vector index.

use anyhow::Result;
use sqlx::SqlitePool;
use std::cmp::Ordering;
use tracing::debug;
use uuid::Uuid;

use crate::config::LinkingConfig;
use crate::embed::cosine_similarity;
use crate::models::{Embedding, Link, LinkType};
use crate::repository;

pub struct Linker {
    pool: SqlitePool,
    config: LinkingConfig,
}

impl Linker {
    pub fn new(pool: SqlitePool, config: LinkingConfig) -> Self {
        Self { pool, config }
    }

    /// Link every embedded chunk of `document_id`. Returns the number of
    /// links written.
    pub async fn link_document(
        &self,
        document_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<usize> {
        let own: Vec<Embedding> = repository::embeddings_for_document(&self.pool, document_id)
            .await?
            .into_iter()
            .filter(|e| e.provider == provider && e.model == model)
            .collect();
        if own.is_empty() || self.config.top_k == 0 {
            return Ok(0);
        }
        let corpus = repository::embeddings_for_model(&self.pool, provider, model).await?;

        let mut written = 0;
        for source in &own {
            for (dst_chunk_id, score) in nearest(source, &corpus, self.config.top_k, self.config.threshold) {
                let link = Link {
                    id: Uuid::new_v4().to_string(),
                    src_chunk_id: source.chunk_id.clone(),
                    dst_chunk_id,
                    score: score as f64,
                    link_type: LinkType::Semantic,
                };
                repository::upsert_link(&self.pool, &link).await?;
                written += 1;
            }
        }

        debug!(document_id, links = written, "linked chunks");
        Ok(written)
    }
}

/// The `top_k` most similar other chunks scoring at least `threshold`,
/// best first.
pub fn nearest(
    source: &Embedding,
    corpus: &[Embedding],
    top_k: usize,
    threshold: f32,
) -> Vec<(String, f32)> {
    let mut scored: Vec<(String, f32)> = corpus
        .iter()
        .filter(|candidate| candidate.chunk_id != source.chunk_id)
        .map(|candidate| {
            (
                candidate.chunk_id.clone(),
                cosine_similarity(&source.vector, &candidate.vector),
            )
        })
        .filter(|(_, score)| *score >= threshold)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);
    scored
}
