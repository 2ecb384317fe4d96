//! Postgres-backed document store
//!
//! The version column carries the optimistic-concurrency check: updates
//! are conditional on the version the caller read, so a lost race shows
//! up as zero affected rows rather than a silently overwritten record.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::db::models::{
    Document, DocumentActiveModel, DocumentColumn, DocumentEntity, Role,
};
use crate::db::store::{DocumentFilter, DocumentStore};
use crate::db::DbPool;
use crate::errors::{AppError, Result};

/// Document store backed by Postgres via SeaORM
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: DbPool,
}

impl PgDocumentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create(
        &self,
        role: Role,
        template_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Document> {
        let doc = Document::new(role, template_id, metadata);

        let active = DocumentActiveModel {
            id: Set(doc.id),
            role: Set(doc.role.clone()),
            template_id: Set(doc.template_id.clone()),
            content: Set(doc.content.clone()),
            rendered_blob_ref: Set(doc.rendered_blob_ref.clone()),
            envelope_id: Set(doc.envelope_id.clone()),
            state: Set(doc.state.clone()),
            error_message: Set(doc.error_message.clone()),
            metadata: Set(doc.metadata.clone()),
            version: Set(doc.version),
            created_at: Set(doc.created_at),
            updated_at: Set(doc.updated_at),
        };

        active.insert(self.pool.conn()).await.map_err(Into::into)
    }

    async fn get(&self, id: Uuid) -> Result<Document> {
        DocumentEntity::find_by_id(id)
            .one(self.pool.conn())
            .await?
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })
    }

    async fn put_versioned(&self, doc: Document) -> Result<Document> {
        let expected = doc.version;
        let now: chrono::DateTime<chrono::FixedOffset> = chrono::Utc::now().into();

        let update = DocumentActiveModel {
            content: Set(doc.content.clone()),
            rendered_blob_ref: Set(doc.rendered_blob_ref.clone()),
            envelope_id: Set(doc.envelope_id.clone()),
            state: Set(doc.state.clone()),
            error_message: Set(doc.error_message.clone()),
            metadata: Set(doc.metadata.clone()),
            version: Set(expected + 1),
            updated_at: Set(now),
            ..Default::default()
        };

        let result = DocumentEntity::update_many()
            .set(update)
            .filter(DocumentColumn::Id.eq(doc.id))
            .filter(DocumentColumn::Version.eq(expected))
            .exec(self.pool.conn())
            .await?;

        if result.rows_affected == 0 {
            // Distinguish a lost race from a missing record
            return match DocumentEntity::find_by_id(doc.id).one(self.pool.conn()).await? {
                Some(_) => Err(AppError::Conflict {
                    id: doc.id.to_string(),
                    expected,
                }),
                None => Err(AppError::DocumentNotFound {
                    id: doc.id.to_string(),
                }),
            };
        }

        self.get(doc.id).await
    }

    async fn list(&self, filter: DocumentFilter) -> Result<Vec<Document>> {
        let mut query = DocumentEntity::find().order_by_desc(DocumentColumn::CreatedAt);

        if let Some(state) = filter.state {
            query = query.filter(DocumentColumn::State.eq(state.as_str()));
        }
        if let Some(role) = filter.role {
            query = query.filter(DocumentColumn::Role.eq(role.as_str()));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        query.all(self.pool.conn()).await.map_err(Into::into)
    }
}
