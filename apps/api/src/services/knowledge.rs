//! Artist knowledge base context
//!
//! Text-like files uploaded for an artist are inlined into the system prompt
//! of every turn bound to that artist.

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::models::KnowledgeEntry;
use crate::repositories::StorageResult;

/// Source of knowledge base entries for an artist
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Textual entries for the artist, in upload order
    async fn entries(&self, artist_id: Uuid) -> StorageResult<Vec<KnowledgeEntry>>;
}

/// Render entries as `--- name ---` delimited blocks
pub fn format_knowledge(entries: &[KnowledgeEntry]) -> String {
    entries
        .iter()
        .filter(|entry| entry.is_textual() && !entry.content.trim().is_empty())
        .map(|entry| format!("--- {} ---\n{}", entry.name, entry.content.trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Knowledge context for a turn
///
/// Best effort: a failing source yields an empty context so the turn can
/// still be answered.
pub async fn knowledge_context(source: &dyn KnowledgeSource, artist_id: Option<Uuid>) -> String {
    let Some(artist_id) = artist_id else {
        return String::new();
    };

    match source.entries(artist_id).await {
        Ok(entries) => format_knowledge(&entries),
        Err(e) => {
            warn!(artist_id = %artist_id, error = %e, "Failed to load artist knowledge base");
            String::new()
        }
    }
}
