//! Read model for entities and the chunk retrieval store.
//!
//! Two traits, so the lookup service only sees entities and the RAG agent
//! only sees chunks:
//!
//! | Trait | Used by | Operations |
//! |-------|---------|------------|
//! | [`EntityStore`] | static lookup, fixture loader | `find_entity`, `get_entity`, `upsert_entity`, `delete_entity` |
//! | [`ChunkStore`] | RAG agent, fixture loader | `search`, `replace_chunks` |
//!
//! Implementations: [`MemoryStore`] (tests, development) and
//! [`SqliteStore`](crate::sqlite_store::SqliteStore).
//!
//! # Search contract
//!
//! `search` returns the top `k` chunks by cosine similarity, ties broken by
//! ascending chunk id, optionally restricted to a set of kinds. Each hit
//! carries a snapshot of its owning entity taken at query time, or `None`
//! when the owner has been deleted. Consumers must suppress such hits.
//!
//! # Writes
//!
//! The pipeline never writes. `replace_chunks` exists for the fixture
//! loader: it drops duplicate texts and deletes the context's chunks that
//! are not in the new set, so chunks stay unique by `(context, text)`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkHit, ContextRef, EntityKind, EntityRecord};

pub use memory::MemoryStore;

/// A chunk to be written by [`ChunkStore::replace_chunks`].
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, kind: EntityKind, key: &str) -> Result<Option<EntityRecord>>;

    /// Find an entity whose key or lowercased name equals `candidate`.
    ///
    /// With no kind hint, every kind is searched and the first match in
    /// `(kind, key)` order wins.
    async fn find_entity(
        &self,
        kind: Option<EntityKind>,
        candidate: &str,
    ) -> Result<Option<EntityRecord>>;

    async fn upsert_entity(&self, record: &EntityRecord) -> Result<()>;

    /// Returns `true` if a row was removed. Chunks are left in place.
    async fn delete_entity(&self, kind: EntityKind, key: &str) -> Result<bool>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn search(&self, vector: &[f32], k: usize, kinds: &[EntityKind])
        -> Result<Vec<ChunkHit>>;

    /// Make `chunks` the full chunk set for `context`. Returns the number
    /// of chunks stored after deduplication.
    async fn replace_chunks(&self, context: &ContextRef, chunks: &[NewChunk]) -> Result<usize>;
}

/// Order hits by similarity descending, then chunk id ascending.
pub(crate) fn rank_hits(hits: &mut Vec<ChunkHit>, k: usize) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
}

/// Drop repeated texts (after trimming) and blank texts, keeping first occurrences.
pub(crate) fn dedup_chunks(chunks: &[NewChunk]) -> Vec<NewChunk> {
    let mut seen = std::collections::HashSet::new();
    chunks
        .iter()
        .filter_map(|c| {
            let text = c.text.trim();
            if text.is_empty() || !seen.insert(text.to_string()) {
                return None;
            }
            Some(NewChunk {
                text: text.to_string(),
                embedding: c.embedding.clone(),
            })
        })
        .collect()
}
