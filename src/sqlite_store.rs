//! SQLite-backed [`EntityStore`] and [`ChunkStore`].
//!
//! Schema (see [`migrate`](crate::migrate)):
//!
//! | Table | Holds |
//! |-------|-------|
//! | `entities` | one row per `(kind, key)`; full record as JSON, lowercased name for lookup |
//! | `contexts` | one row per chunk owner reference, `id = "kind:key"` |
//! | `chunks` | text + f32 BLOB embedding, unique by `(context_id, text)` |
//!
//! Search joins chunks to their context and `LEFT JOIN`s the entity, so a
//! deleted owner shows up as a hit with `entity = None`.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::warn;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkHit, ContextRef, EntityKind, EntityRecord};
use crate::store::{dedup_chunks, rank_hits, ChunkStore, EntityStore, NewChunk};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_record(json: &str) -> Result<EntityRecord> {
    serde_json::from_str(json).context("Failed to parse stored entity record")
}

fn lookup_name(record: &EntityRecord) -> Option<String> {
    record
        .name
        .as_deref()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn get_entity(&self, kind: EntityKind, key: &str) -> Result<Option<EntityRecord>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record_json FROM entities WHERE kind = ? AND key = ?")
                .bind(kind.as_str())
                .bind(key.to_lowercase())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| parse_record(&json)).transpose()
    }

    async fn find_entity(
        &self,
        kind: Option<EntityKind>,
        candidate: &str,
    ) -> Result<Option<EntityRecord>> {
        let candidate = candidate.to_lowercase();
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT record_json FROM entities WHERE (key = ");
        qb.push_bind(candidate.clone());
        qb.push(" OR lookup_name = ");
        qb.push_bind(candidate);
        qb.push(")");
        if let Some(kind) = kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind.as_str());
        }
        qb.push(" ORDER BY kind, key LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(|r| parse_record(&r.get::<String, _>("record_json")))
            .transpose()
    }

    async fn upsert_entity(&self, record: &EntityRecord) -> Result<()> {
        let kind = record
            .kind
            .with_context(|| format!("entity '{}' has no kind", record.key))?;
        let mut stored = record.clone();
        stored.key = record.key.to_lowercase();
        let json = serde_json::to_string(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO entities (kind, key, lookup_name, record_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(kind, key) DO UPDATE SET
                lookup_name = excluded.lookup_name,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(&stored.key)
        .bind(lookup_name(&stored))
        .bind(json)
        .bind(stored.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entities WHERE kind = ? AND key = ?")
            .bind(kind.as_str())
            .bind(key.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        kinds: &[EntityKind],
    ) -> Result<Vec<ChunkHit>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT c.id, c.text, c.embedding, ctx.kind, ctx.key, e.record_json
            FROM chunks c
            JOIN contexts ctx ON ctx.id = c.context_id
            LEFT JOIN entities e ON e.kind = ctx.kind AND e.key = ctx.key
            "#,
        );
        if !kinds.is_empty() {
            qb.push(" WHERE ctx.kind IN (");
            let mut separated = qb.separated(", ");
            for kind in kinds {
                separated.push_bind(kind.as_str());
            }
            separated.push_unseparated(")");
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk_id: String = row.get("id");
            let kind_raw: String = row.get("kind");
            let kind = match EntityKind::from_str(&kind_raw) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(chunk_id = %chunk_id, error = %e, "skipping chunk with unknown owner kind");
                    continue;
                }
            };
            let entity = match row.get::<Option<String>, _>("record_json") {
                Some(json) => match parse_record(&json) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(chunk_id = %chunk_id, error = %e, "owner record unreadable; treating as missing");
                        None
                    }
                },
                None => None,
            };
            let blob: Vec<u8> = row.get("embedding");
            hits.push(ChunkHit {
                similarity: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                text: row.get("text"),
                context_ref: ContextRef::new(kind, row.get::<String, _>("key")),
                entity,
                chunk_id,
            });
        }

        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn replace_chunks(&self, context: &ContextRef, chunks: &[NewChunk]) -> Result<usize> {
        let fresh = dedup_chunks(chunks);
        let context_id = context.to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO contexts (id, kind, key) VALUES (?, ?, ?)")
            .bind(&context_id)
            .bind(context.kind.as_str())
            .bind(&context.key)
            .execute(&mut *tx)
            .await?;

        let existing: Vec<(String, String)> =
            sqlx::query_as("SELECT id, text FROM chunks WHERE context_id = ?")
                .bind(&context_id)
                .fetch_all(&mut *tx)
                .await?;
        let mut existing: HashMap<String, String> =
            existing.into_iter().map(|(id, text)| (text, id)).collect();

        for chunk in &fresh {
            match existing.remove(&chunk.text) {
                Some(id) => {
                    sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
                        .bind(vec_to_blob(&chunk.embedding))
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO chunks (id, context_id, text, embedding, created_at) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(uuid::Uuid::new_v4().to_string())
                    .bind(&context_id)
                    .bind(&chunk.text)
                    .bind(vec_to_blob(&chunk.embedding))
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        // Whatever is left was not in the new set.
        for stale_id in existing.values() {
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(stale_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(fresh.len())
    }
}
