//! Durable hand-off of processed-document events.
//!
//! Events are written to the `outbox` table and left for a downstream
//! consumer to drain with [`OutboxPublisher::pending`] and
//! [`OutboxPublisher::mark_delivered`]. Delivery is at-least-once at best;
//! nothing here retries or acknowledges on the consumer's behalf.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

/// Emitted once a document has been fully processed.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentEvent {
    pub document_id: String,
    pub uri: String,
    pub title: Option<String>,
    pub chunks: usize,
    pub summaries: usize,
    pub embeddings: usize,
    pub processed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxEvent {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, event: &DocumentEvent) -> Result<()>;
}

/// Publisher used when the outbox is disabled.
pub struct NoopPublisher;

#[async_trait]
impl ResultPublisher for NoopPublisher {
    async fn publish(&self, _event: &DocumentEvent) -> Result<()> {
        Ok(())
    }
}

pub struct OutboxPublisher {
    pool: SqlitePool,
    topic: String,
}

impl OutboxPublisher {
    pub fn new(pool: SqlitePool, topic: impl Into<String>) -> Self {
        Self {
            pool,
            topic: topic.into(),
        }
    }

    /// Undelivered events, oldest first.
    pub async fn pending(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload_json, created_at, delivered_at
            FROM outbox
            WHERE delivered_at IS NULL
            ORDER BY created_at, rowid
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<OutboxEvent> {
                let payload: String = row.get("payload_json");
                Ok(OutboxEvent {
                    id: row.get("id"),
                    topic: row.get("topic"),
                    payload: serde_json::from_str(&payload)?,
                    created_at: row.get("created_at"),
                    delivered_at: row.get("delivered_at"),
                })
            })
            .collect()
    }

    /// Returns `false` if the event is unknown or already delivered.
    pub async fn mark_delivered(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ResultPublisher for OutboxPublisher {
    async fn publish(&self, event: &DocumentEvent) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO outbox (id, topic, payload_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&self.topic)
        .bind(serde_json::to_string(event)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        debug!(event_id = %id, topic = %self.topic, document_id = %event.document_id, "event queued");
        Ok(())
    }
}
