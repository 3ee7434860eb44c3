use anyhow::Result;
use sqlx::SqlitePool;

/// Create the read-model schema. Safe to run repeatedly.
///
/// `chunks` reference `contexts`, not `entities`: the
/// ingestion side may delete an entity before its chunks, and search
/// reports such chunks with no owner.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            key TEXT NOT NULL,
            lookup_name TEXT,
            record_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contexts (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            key TEXT NOT NULL,
            UNIQUE(kind, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            context_id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(context_id, text),
            FOREIGN KEY (context_id) REFERENCES contexts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_context_id ON chunks(context_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_lookup_name ON entities(lookup_name)")
        .execute(pool)
        .await?;

    Ok(())
}
