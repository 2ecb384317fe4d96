//! Reference insurance plans
//!
//! Plans are loaded from a JSON file and upserted into the comparison
//! index under `plan:` record ids. Loading is idempotent: re-running it
//! replaces each plan's record wholesale.

use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::index::{ComparisonIndex, ComparisonRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A reference insurance plan used for semantic comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferencePlan {
    pub plan_id: String,
    pub name: String,
    /// Plan terms text, embedded for similarity search
    pub summary: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ReferencePlan {
    /// Record id in the comparison index
    pub fn record_id(&self) -> String {
        format!("plan:{}", self.plan_id)
    }
}

/// Parse reference plans from JSON
pub fn parse_reference_plans(json: &str) -> Result<Vec<ReferencePlan>> {
    serde_json::from_str(json).map_err(|e| AppError::Configuration {
        message: format!("Invalid reference plans file: {}", e),
    })
}

/// Load reference plans from the configured file
pub async fn load_reference_plans(path: &str) -> Result<Vec<ReferencePlan>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::Configuration {
            message: format!("Cannot read reference plans file {}: {}", path, e),
        })?;
    parse_reference_plans(&json)
}

/// Embed and upsert every plan into the comparison index
pub async fn index_reference_plans(
    index: &Arc<dyn ComparisonIndex>,
    embedder: &Arc<dyn Embedder>,
    plans: &[ReferencePlan],
) -> Result<usize> {
    let texts: Vec<String> = plans
        .iter()
        .map(|p| format!("{}\n{}", p.name, p.summary))
        .collect();
    let vectors = embedder.embed_batch(&texts).await?;

    for (plan, vector) in plans.iter().zip(vectors) {
        let metadata = serde_json::json!({
            "kind": "reference_plan",
            "plan_id": plan.plan_id,
            "name": plan.name,
            "extra": plan.metadata,
        });
        index
            .upsert(ComparisonRecord::new(&plan.record_id(), vector, metadata))
            .await?;
    }

    info!(count = plans.len(), "Indexed reference plans");
    Ok(plans.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbedder;
    use crate::index::MemoryIndex;

    const SAMPLE: &str = r#"[
        {
            "plan_id": "gold-ppo",
            "name": "Gold PPO",
            "summary": "Low deductible, broad provider network, specialist visits covered."
        },
        {
            "plan_id": "bronze-hmo",
            "name": "Bronze HMO",
            "summary": "High deductible, narrow network, referrals required.",
            "metadata": {"tier": "bronze"}
        }
    ]"#;

    #[test]
    fn test_parse_reference_plans() {
        let plans = parse_reference_plans(SAMPLE).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].record_id(), "plan:gold-ppo");
        assert_eq!(plans[1].metadata["tier"], "bronze");
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = parse_reference_plans("{not json").unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_index_reference_plans_is_idempotent() {
        let index: Arc<dyn ComparisonIndex> = Arc::new(MemoryIndex::new());
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(64));
        let plans = parse_reference_plans(SAMPLE).unwrap();

        index_reference_plans(&index, &embedder, &plans).await.unwrap();
        index_reference_plans(&index, &embedder, &plans).await.unwrap();

        // No duplicates: querying with one plan's own vector returns it on top
        let vector = embedder.embed("Gold PPO\nLow deductible, broad provider network, specialist visits covered.").await.unwrap();
        let results = index.query(&vector, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record_id, "plan:gold-ppo");
    }
}
