use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the metadata tables on an open pool. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // One row per unit or fragment; row keys compare case-insensitively
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unit_entities (
            partition_key TEXT NOT NULL COLLATE NOCASE,
            row_key TEXT NOT NULL COLLATE NOCASE,
            name TEXT NOT NULL,
            author TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            group_name TEXT NOT NULL DEFAULT '',
            last_modified INTEGER NOT NULL,
            is_disabled INTEGER NOT NULL DEFAULT 0,
            is_internal INTEGER NOT NULL DEFAULT 0,
            resource_provider TEXT,
            resource_type TEXT,
            dependencies_json TEXT NOT NULL DEFAULT '[]',
            support_topics_json TEXT NOT NULL DEFAULT '[]',
            content_hash TEXT,
            PRIMARY KEY (partition_key, row_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_unit_entities_modified ON unit_entities(partition_key, last_modified)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
