mod common;

use docflow::chunk::TextChunk;
use docflow::error::{is_storage, PipelineError};
use docflow::models::{Document, DocumentStatus, Embedding, Link, LinkType, SourceType, Summary};
use docflow::repository;
use sqlx::SqlitePool;
use uuid::Uuid;

async fn insert_doc(pool: &SqlitePool, uri: &str) -> Document {
    let now = chrono::Utc::now().timestamp();
    let doc = Document {
        id: Uuid::new_v4().to_string(),
        source_type: SourceType::File,
        uri: uri.to_string(),
        path: Some(uri.to_string()),
        mtime: now,
        size: 10,
        content_hash: "abc".to_string(),
        title: Some("doc".to_string()),
        metadata_json: "{}".to_string(),
        status: DocumentStatus::Pending,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    let mut conn = pool.acquire().await.unwrap();
    repository::insert_document(&mut conn, &doc).await.unwrap();
    doc
}

fn text_chunks(texts: &[&str]) -> Vec<TextChunk> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| TextChunk {
            ordinal: i,
            text: t.to_string(),
            token_count: t.split_whitespace().count(),
            start: 0,
            end: t.len(),
            hash: format!("hash-{}", i),
        })
        .collect()
}

fn embedding(chunk_id: &str, vector: Vec<f32>) -> Embedding {
    Embedding {
        id: Uuid::new_v4().to_string(),
        chunk_id: chunk_id.to_string(),
        provider: "fake".to_string(),
        model: "fake-embed".to_string(),
        dim: vector.len() as i64,
        vector,
    }
}

#[tokio::test]
async fn test_replace_chunks_swaps_whole_set() {
    let env = common::setup().await;
    let doc = insert_doc(&env.pool, "/docs/a.md").await;

    let first = repository::replace_chunks(&env.pool, &doc.id, &text_chunks(&["one", "two", "three"]))
        .await
        .unwrap();
    repository::upsert_embedding(&env.pool, &embedding(&first[0].id, vec![1.0, 0.0]))
        .await
        .unwrap();

    let second = repository::replace_chunks(&env.pool, &doc.id, &text_chunks(&["only"]))
        .await
        .unwrap();
    let stored = repository::chunks_for_document(&env.pool, &doc.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, second[0].id);
    assert_eq!(stored[0].text, "only");

    // Embeddings of the old chunk set go with it.
    assert!(repository::embeddings_for_document(&env.pool, &doc.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_embedding_upsert_overwrites() {
    let env = common::setup().await;
    let doc = insert_doc(&env.pool, "/docs/a.md").await;
    let chunks = repository::replace_chunks(&env.pool, &doc.id, &text_chunks(&["x"]))
        .await
        .unwrap();

    repository::upsert_embedding(&env.pool, &embedding(&chunks[0].id, vec![1.0, 2.0]))
        .await
        .unwrap();
    repository::upsert_embedding(&env.pool, &embedding(&chunks[0].id, vec![3.0, 4.0, 5.0]))
        .await
        .unwrap();

    let stored = repository::embeddings_for_model(&env.pool, "fake", "fake-embed")
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].vector, vec![3.0, 4.0, 5.0]);
    assert_eq!(stored[0].dim, 3);
}

#[tokio::test]
async fn test_link_upsert_rescores() {
    let env = common::setup().await;
    let doc = insert_doc(&env.pool, "/docs/a.md").await;
    let chunks = repository::replace_chunks(&env.pool, &doc.id, &text_chunks(&["a", "b"]))
        .await
        .unwrap();

    for score in [0.5, 0.9] {
        repository::upsert_link(
            &env.pool,
            &Link {
                id: Uuid::new_v4().to_string(),
                src_chunk_id: chunks[0].id.clone(),
                dst_chunk_id: chunks[1].id.clone(),
                score,
                link_type: LinkType::Semantic,
            },
        )
        .await
        .unwrap();
    }

    let links = repository::links_from_chunk(&env.pool, &chunks[0].id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert!((links[0].score - 0.9).abs() < 1e-9);
    assert_eq!(links[0].link_type, LinkType::Semantic);
}

#[tokio::test]
async fn test_latest_summary_wins() {
    let env = common::setup().await;
    let doc = insert_doc(&env.pool, "/docs/a.md").await;

    for (text, created_at) in [("older", 100), ("newer", 200)] {
        repository::insert_summary(
            &env.pool,
            &Summary {
                id: Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                chunk_id: None,
                model: "fake-chat".to_string(),
                text: text.to_string(),
                created_at,
            },
        )
        .await
        .unwrap();
    }

    let latest = repository::latest_summary(&env.pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(latest.text, "newer");
}

#[tokio::test]
async fn test_delete_document_cascades() {
    let env = common::setup().await;
    let doc = insert_doc(&env.pool, "/docs/a.md").await;
    let chunks = repository::replace_chunks(&env.pool, &doc.id, &text_chunks(&["a", "b"]))
        .await
        .unwrap();
    repository::upsert_embedding(&env.pool, &embedding(&chunks[0].id, vec![1.0]))
        .await
        .unwrap();

    let mut conn = env.pool.acquire().await.unwrap();
    repository::delete_document(&mut conn, &doc.id).await.unwrap();
    drop(conn);

    let stats = repository::catalog_stats(&env.pool).await.unwrap();
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.chunks, 0);
    assert_eq!(stats.embeddings, 0);
}

#[tokio::test]
async fn test_status_transitions_and_pending_filter() {
    let env = common::setup().await;
    let a = insert_doc(&env.pool, "/docs/a.md").await;
    let b = insert_doc(&env.pool, "/docs/sub/b.md").await;
    insert_doc(&env.pool, "/other/c.md").await;

    repository::mark_failed(&env.pool, &a.id, "boom").await.unwrap();
    let failed = repository::get_document(&env.pool, &a.id).await.unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));

    repository::mark_processed(&env.pool, &a.id, Some("Alpha"), r#"{"k":1}"#)
        .await
        .unwrap();
    let processed = repository::get_document(&env.pool, &a.id).await.unwrap().unwrap();
    assert_eq!(processed.status, DocumentStatus::Processed);
    assert!(processed.error_message.is_none());
    assert_eq!(processed.title.as_deref(), Some("Alpha"));

    let under_docs = repository::pending_documents(&env.pool, Some("/docs/")).await.unwrap();
    assert_eq!(under_docs.len(), 1);
    assert_eq!(under_docs[0].id, b.id);
    assert_eq!(repository::pending_documents(&env.pool, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_chunk_write_is_storage_error() {
    let env = common::setup().await;
    let doc = insert_doc(&env.pool, "/docs/a.md").await;
    repository::replace_chunks(&env.pool, &doc.id, &text_chunks(&["kept"]))
        .await
        .unwrap();

    // No such document: the foreign key rejects the insert.
    let err = repository::replace_chunks(&env.pool, "missing", &text_chunks(&["x"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Storage(_))
    ));
    assert!(is_storage(&err));

    let stored = repository::chunks_for_document(&env.pool, &doc.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "kept");
}
