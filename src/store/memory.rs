//! In-memory [`EntityStore`] and [`ChunkStore`] for tests and development.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every stored chunk.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, ChunkHit, ContextRef, EntityKind, EntityRecord};

use super::{dedup_chunks, rank_hits, ChunkStore, EntityStore, NewChunk};

type EntityMap = HashMap<(EntityKind, String), EntityRecord>;

pub struct MemoryStore {
    entities: RwLock<EntityMap>,
    chunks: RwLock<Vec<Chunk>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Insert a chunk as-is, bypassing deduplication. Lets tests stage
    /// arbitrary store contents, including chunks whose owner never existed.
    pub fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
        self.write_chunks()?.push(chunk);
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    fn read_entities(&self) -> Result<RwLockReadGuard<'_, EntityMap>> {
        self.entities
            .read()
            .map_err(|_| anyhow!("entity map lock poisoned"))
    }

    fn write_entities(&self) -> Result<RwLockWriteGuard<'_, EntityMap>> {
        self.entities
            .write()
            .map_err(|_| anyhow!("entity map lock poisoned"))
    }

    fn write_chunks(&self) -> Result<RwLockWriteGuard<'_, Vec<Chunk>>> {
        self.chunks
            .write()
            .map_err(|_| anyhow!("chunk list lock poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, kind: EntityKind, key: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .read_entities()?
            .get(&(kind, key.to_lowercase()))
            .cloned())
    }

    async fn find_entity(
        &self,
        kind: Option<EntityKind>,
        candidate: &str,
    ) -> Result<Option<EntityRecord>> {
        let candidate = candidate.to_lowercase();
        let entities = self.read_entities()?;
        Ok(entities
            .iter()
            .filter(|((k, _), _)| kind.map_or(true, |want| *k == want))
            .filter(|((_, key), record)| {
                *key == candidate
                    || record
                        .name
                        .as_deref()
                        .map(|n| n.trim().to_lowercase() == candidate)
                        .unwrap_or(false)
            })
            .min_by(|((ka, keya), _), ((kb, keyb), _)| {
                ka.as_str().cmp(kb.as_str()).then_with(|| keya.cmp(keyb))
            })
            .map(|(_, record)| record.clone()))
    }

    async fn upsert_entity(&self, record: &EntityRecord) -> Result<()> {
        let kind = record
            .kind
            .with_context(|| format!("entity '{}' has no kind", record.key))?;
        let mut stored = record.clone();
        stored.key = record.key.to_lowercase();
        self.write_entities()?.insert((kind, stored.key.clone()), stored);
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, key: &str) -> Result<bool> {
        Ok(self
            .write_entities()?
            .remove(&(kind, key.to_lowercase()))
            .is_some())
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        kinds: &[EntityKind],
    ) -> Result<Vec<ChunkHit>> {
        let entities = self.read_entities()?;
        let chunks = self
            .chunks
            .read()
            .map_err(|_| anyhow!("chunk list lock poisoned"))?;

        let mut hits: Vec<ChunkHit> = chunks
            .iter()
            .filter(|c| kinds.is_empty() || kinds.contains(&c.context_ref.kind))
            .map(|c| ChunkHit {
                chunk_id: c.id.clone(),
                text: c.text.clone(),
                similarity: cosine_similarity(vector, &c.embedding) as f64,
                context_ref: c.context_ref.clone(),
                entity: entities
                    .get(&(c.context_ref.kind, c.context_ref.key.clone()))
                    .cloned(),
            })
            .collect();

        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn replace_chunks(&self, context: &ContextRef, chunks: &[NewChunk]) -> Result<usize> {
        let fresh = dedup_chunks(chunks);
        let mut stored = self.write_chunks()?;

        let mut existing: HashMap<String, String> = stored
            .iter()
            .filter(|c| &c.context_ref == context)
            .map(|c| (c.text.clone(), c.id.clone()))
            .collect();
        stored.retain(|c| &c.context_ref != context);

        let now = chrono::Utc::now().timestamp();
        for chunk in &fresh {
            let id = existing
                .remove(&chunk.text)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            stored.push(Chunk {
                id,
                text: chunk.text.clone(),
                embedding: chunk.embedding.clone(),
                context_ref: context.clone(),
                created_at: now,
            });
        }
        Ok(fresh.len())
    }
}
