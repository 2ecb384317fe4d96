//! Comparison index abstraction
//!
//! A vector store over documents and reference insurance plans,
//! supporting nearest-neighbor similarity queries. Upserts replace the
//! prior record wholesale and are idempotent; queries observe either
//! the pre- or post-upsert record, never a partial write.

pub mod plans;

use crate::db::DbPool;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbBackend, Statement};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A vector embedding plus metadata tied to a document or reference plan
#[derive(Debug, Clone)]
pub struct ComparisonRecord {
    pub record_id: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
    pub updated_at: chrono::DateTime<chrono::FixedOffset>,
}

impl ComparisonRecord {
    pub fn new(record_id: &str, vector: Vec<f32>, metadata: serde_json::Value) -> Self {
        Self {
            record_id: record_id.to_string(),
            vector,
            metadata,
            updated_at: chrono::Utc::now().into(),
        }
    }
}

/// A query hit, ordered by descending similarity
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredRecord {
    pub record_id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// Trait for vector upsert/query
#[async_trait]
pub trait ComparisonIndex: Send + Sync {
    /// Insert or replace a record atomically
    async fn upsert(&self, record: ComparisonRecord) -> Result<()>;

    /// Nearest-neighbor query: top `k` by descending similarity, ties
    /// broken by most-recent update
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>>;
}

/// Reject non-positive k before touching the index
fn validate_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(AppError::InvalidQuery {
            message: "k must be a positive integer".to_string(),
        });
    }
    Ok(())
}

/// In-process index backing tests and single-node deployments
#[derive(Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<String, ComparisonRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl ComparisonIndex for MemoryIndex {
    async fn upsert(&self, mut record: ComparisonRecord) -> Result<()> {
        record.updated_at = chrono::Utc::now().into();
        self.records
            .write()
            .await
            .insert(record.record_id.clone(), record);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        validate_k(k)?;

        let records = self.records.read().await;
        let mut scored: Vec<(f32, chrono::DateTime<chrono::FixedOffset>, ScoredRecord)> = records
            .values()
            .map(|r| {
                let score = cosine_similarity(vector, &r.vector);
                (
                    score,
                    r.updated_at,
                    ScoredRecord {
                        record_id: r.record_id.clone(),
                        score,
                        metadata: r.metadata.clone(),
                    },
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });

        Ok(scored.into_iter().take(k).map(|(_, _, r)| r).collect())
    }
}

/// Postgres pgvector index using raw SQL
pub struct PgVectorIndex {
    db: DbPool,
}

impl PgVectorIndex {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn embedding_literal(vector: &[f32]) -> String {
        format!(
            "[{}]",
            vector
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

#[async_trait]
impl ComparisonIndex for PgVectorIndex {
    async fn upsert(&self, record: ComparisonRecord) -> Result<()> {
        let embedding = Self::embedding_literal(&record.vector);
        let sql = format!(
            r#"
            INSERT INTO comparison_records (record_id, embedding, metadata, updated_at)
            VALUES ($1, '{embedding}'::vector, $2, NOW())
            ON CONFLICT (record_id)
            DO UPDATE SET embedding = EXCLUDED.embedding,
                          metadata = EXCLUDED.metadata,
                          updated_at = NOW()
            "#,
            embedding = embedding
        );

        self.db
            .conn()
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                vec![record.record_id.into(), record.metadata.into()],
            ))
            .await
            .map_err(|e| AppError::Index {
                message: format!("Upsert failed: {}", e),
            })?;

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        validate_k(k)?;

        let embedding = Self::embedding_literal(vector);
        let sql = format!(
            r#"
            SELECT
                record_id,
                metadata,
                1 - (embedding <=> '{embedding}'::vector) as score
            FROM comparison_records
            ORDER BY embedding <=> '{embedding}'::vector, updated_at DESC
            LIMIT $1
            "#,
            embedding = embedding
        );

        let rows = self
            .db
            .conn()
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                vec![(k as i64).into()],
            ))
            .await
            .map_err(|e| AppError::Index {
                message: format!("Query failed: {}", e),
            })?;

        let results = rows
            .iter()
            .map(|row| ScoredRecord {
                record_id: row.try_get("", "record_id").unwrap_or_default(),
                score: row.try_get::<f64>("", "score").unwrap_or_default() as f32,
                metadata: row
                    .try_get("", "metadata")
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();

        Ok(results)
    }
}

/// Create a comparison index based on configuration
pub fn create_index(backend: &str, db: Option<DbPool>) -> Arc<dyn ComparisonIndex> {
    match backend {
        "pgvector" => {
            let db = db.expect("pgvector index requires a database pool");
            Arc::new(PgVectorIndex::new(db))
        }
        "memory" => Arc::new(MemoryIndex::new()),
        other => {
            tracing::warn!(backend = other, "Unknown index backend, using memory");
            Arc::new(MemoryIndex::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, vector: Vec<f32>) -> ComparisonRecord {
        ComparisonRecord::new(id, vector, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_round_trip_exact_vector_is_top_result() {
        let index = MemoryIndex::new();
        index.upsert(record("X", vec![1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(record("Y", vec![0.0, 1.0, 0.0])).await.unwrap();
        index
            .upsert(record("Z", vec![0.5, 0.5, 0.0]))
            .await
            .unwrap();

        let results = index.query(&[1.0, 0.0, 0.0], 3).await.unwrap();
        assert_eq!(results[0].record_id, "X");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_query_rejects_zero_k() {
        let index = MemoryIndex::new();
        index.upsert(record("X", vec![1.0, 0.0])).await.unwrap();

        let err = index.query(&[1.0, 0.0], 0).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery { .. }));

        // Index state unchanged
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_replacement() {
        let index = MemoryIndex::new();
        index.upsert(record("X", vec![1.0, 0.0])).await.unwrap();
        index
            .upsert(ComparisonRecord::new(
                "X",
                vec![0.0, 1.0],
                serde_json::json!({"replaced": true}),
            ))
            .await
            .unwrap();

        assert_eq!(index.len().await, 1);
        let results = index.query(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(results[0].record_id, "X");
        assert_eq!(results[0].metadata["replaced"], true);
    }

    #[tokio::test]
    async fn test_ties_break_by_most_recent_update() {
        let index = MemoryIndex::new();
        index.upsert(record("older", vec![1.0, 0.0])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        index.upsert(record("newer", vec![1.0, 0.0])).await.unwrap();

        let results = index.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results[0].record_id, "newer");
        assert_eq!(results[1].record_id, "older");
    }

    #[tokio::test]
    async fn test_k_caps_result_count() {
        let index = MemoryIndex::new();
        for i in 0..5 {
            index
                .upsert(record(&format!("r{i}"), vec![1.0, i as f32]))
                .await
                .unwrap();
        }
        let results = index.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
