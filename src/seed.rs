//! Development seeding of the entity and chunk read model.
//!
//! Production data is written by a separate ingestion service. For local
//! runs and tests, `askh load <fixtures.json>` reads a file of the form:
//!
//! ```json
//! {
//!   "entities": [{ "kind": "project", "key": "alpha", "name": "Alpha", "leaders": ["Alice"] }],
//!   "chunks": [{ "kind": "project", "key": "alpha", "text": "Alpha is a scanner." }]
//! }
//! ```
//!
//! Chunk texts are grouped by owning entity, embedded in batches, and written
//! with [`ChunkStore::replace_chunks`], so reloading a fixture file is
//! idempotent and drops chunks no longer listed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::models::{ContextRef, EntityKind, EntityRecord};
use crate::sqlite_store::SqliteStore;
use crate::store::{ChunkStore, EntityStore, NewChunk};
use crate::{db, migrate};

const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, Default, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub chunks: Vec<FixtureChunk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureChunk {
    pub kind: EntityKind,
    pub key: String,
    pub text: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedStats {
    pub entities: usize,
    pub contexts: usize,
    pub chunks: usize,
    pub skipped_entities: usize,
}

pub fn load_fixtures(path: &Path) -> Result<Fixtures> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixtures file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse fixtures file: {}", path.display()))
}

/// Write `fixtures` into the given stores.
///
/// Entities without a kind or name are skipped with a warning. An embedding
/// failure aborts the load.
pub async fn seed(
    fixtures: &Fixtures,
    entities: &dyn EntityStore,
    chunks: &dyn ChunkStore,
    embedder: &dyn EmbeddingProvider,
) -> Result<SeedStats> {
    let mut stats = SeedStats::default();

    for record in &fixtures.entities {
        if record.handle().is_none() {
            warn!(key = %record.key, "fixture entity is missing kind or name; skipping");
            stats.skipped_entities += 1;
            continue;
        }
        entities.upsert_entity(record).await?;
        stats.entities += 1;
    }

    let mut grouped: BTreeMap<String, (ContextRef, Vec<String>)> = BTreeMap::new();
    for chunk in &fixtures.chunks {
        let context = ContextRef::new(chunk.kind, chunk.key.clone());
        grouped
            .entry(context.to_string())
            .or_insert_with(|| (context, Vec::new()))
            .1
            .push(chunk.text.clone());
    }

    for (context, texts) in grouped.into_values() {
        let mut new_chunks = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let vectors = embedder
                .embed(batch)
                .await
                .with_context(|| format!("Failed to embed chunks for {}", context))?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            new_chunks.extend(batch.iter().zip(vectors).map(|(text, embedding)| NewChunk {
                text: text.clone(),
                embedding,
            }));
        }
        stats.chunks += chunks.replace_chunks(&context, &new_chunks).await?;
        stats.contexts += 1;
    }

    Ok(stats)
}

/// `askh load`: seed the configured SQLite database from a fixtures file.
pub async fn run_load(config: &Config, path: &Path) -> Result<()> {
    let fixtures = load_fixtures(path)?;
    let embedder = create_provider(&config.embedding)?;
    if !fixtures.chunks.is_empty() && !config.embedding.is_enabled() {
        bail!("Loading chunks requires an embedding provider. Set [embedding] provider in config.");
    }

    let pool = db::connect(&config.db).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);

    let stats = seed(&fixtures, &store, &store, embedder.as_ref()).await?;

    println!("load {}", path.display());
    println!("  entities upserted: {}", stats.entities);
    if stats.skipped_entities > 0 {
        println!("  entities skipped: {}", stats.skipped_entities);
    }
    println!("  contexts: {}", stats.contexts);
    println!("  chunks stored: {}", stats.chunks);
    println!("ok");
    Ok(())
}
