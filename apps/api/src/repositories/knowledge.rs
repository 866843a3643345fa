//! Artist knowledge base queries

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use super::StorageResult;
use crate::models::KnowledgeEntry;
use crate::services::knowledge::KnowledgeSource;

/// Reads knowledge documents attached to artists
#[derive(Clone)]
pub struct KnowledgeRepository {
    pool: PgPool,
}

impl KnowledgeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Textual knowledge entries for an artist, oldest first
    #[instrument(skip(self))]
    pub async fn entries_for_artist(&self, artist_id: Uuid) -> StorageResult<Vec<KnowledgeEntry>> {
        let entries = sqlx::query_as::<_, KnowledgeEntry>(
            r#"
            SELECT name, mime_type, content
            FROM artist_knowledge
            WHERE artist_id = $1 AND mime_type = ANY($2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(artist_id)
        .bind(&KnowledgeEntry::TEXT_TYPES[..])
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[async_trait]
impl KnowledgeSource for KnowledgeRepository {
    async fn entries(&self, artist_id: Uuid) -> StorageResult<Vec<KnowledgeEntry>> {
        self.entries_for_artist(artist_id).await
    }
}
