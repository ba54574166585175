//! SQLite-backed [`SourceStore`].
//!
//! Rows live in the `unit_entities` table created by
//! [`migrate::create_schema`](crate::migrate::create_schema).
//! Timestamps are stored as Unix milliseconds; dependency and support
//! topic lists as JSON text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};

use unit_harness_core::models::{MetadataEntity, SupportTopic};
use unit_harness_core::store::SourceStore;

/// SQLite implementation of the [`SourceStore`] trait.
pub struct SqliteSourceStore {
    pool: SqlitePool,
}

impl SqliteSourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO unit_entities (partition_key, row_key, name, author, description,
                               group_name, last_modified, is_disabled, is_internal,
                               resource_provider, resource_type, dependencies_json,
                               support_topics_json, content_hash)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(partition_key, row_key) DO UPDATE SET
        row_key = excluded.row_key,
        name = excluded.name,
        author = excluded.author,
        description = excluded.description,
        group_name = excluded.group_name,
        last_modified = excluded.last_modified,
        is_disabled = excluded.is_disabled,
        is_internal = excluded.is_internal,
        resource_provider = excluded.resource_provider,
        resource_type = excluded.resource_type,
        dependencies_json = excluded.dependencies_json,
        support_topics_json = excluded.support_topics_json,
        content_hash = excluded.content_hash
"#;

fn upsert_query(
    entity: &MetadataEntity,
) -> Result<sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>>> {
    let dependencies = serde_json::to_string(&entity.dependencies)?;
    let support_topics = serde_json::to_string(&entity.support_topics)?;
    Ok(sqlx::query(UPSERT_SQL)
        .bind(&entity.partition_key)
        .bind(&entity.row_key)
        .bind(&entity.name)
        .bind(&entity.author)
        .bind(&entity.description)
        .bind(&entity.group)
        .bind(entity.last_modified.timestamp_millis())
        .bind(entity.is_disabled)
        .bind(entity.is_internal)
        .bind(&entity.resource_provider)
        .bind(&entity.resource_type)
        .bind(dependencies)
        .bind(support_topics)
        .bind(&entity.content_hash))
}

fn entity_from_row(row: &SqliteRow) -> Result<MetadataEntity> {
    let row_key: String = row.get("row_key");
    let millis: i64 = row.get("last_modified");
    let last_modified = DateTime::<Utc>::from_timestamp_millis(millis)
        .with_context(|| format!("row '{}' has an invalid timestamp {}", row_key, millis))?;
    let dependencies: String = row.get("dependencies_json");
    let support_topics: String = row.get("support_topics_json");

    Ok(MetadataEntity {
        partition_key: row.get("partition_key"),
        name: row.get("name"),
        author: row.get("author"),
        description: row.get("description"),
        group: row.get("group_name"),
        last_modified,
        is_disabled: row.get("is_disabled"),
        is_internal: row.get("is_internal"),
        resource_provider: row.get("resource_provider"),
        resource_type: row.get("resource_type"),
        dependencies: serde_json::from_str(&dependencies)
            .with_context(|| format!("row '{}' has malformed dependencies", row_key))?,
        support_topics: serde_json::from_str::<Vec<SupportTopic>>(&support_topics)
            .with_context(|| format!("row '{}' has malformed support topics", row_key))?,
        content_hash: row.get("content_hash"),
        row_key,
    })
}

#[async_trait]
impl SourceStore for SqliteSourceStore {
    async fn fetch_rows_by_category(
        &self,
        category: &str,
        modified_since: DateTime<Utc>,
    ) -> Result<Vec<MetadataEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM unit_entities
            WHERE partition_key = ? AND last_modified >= ?
            ORDER BY last_modified ASC, row_key ASC
            "#,
        )
        .bind(category)
        .bind(modified_since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch rows for category '{}'", category))?;

        rows.iter().map(entity_from_row).collect()
    }

    async fn upsert(&self, entity: &MetadataEntity) -> Result<()> {
        upsert_query(entity)?
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to upsert '{}'", entity.row_key))?;
        Ok(())
    }

    async fn upsert_batch(&self, entities: &[MetadataEntity]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            upsert_query(entity)?.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_schema;
    use chrono::TimeZone;
    use unit_harness_core::store::EPOCH;

    async fn store() -> (tempfile::TempDir, SqliteSourceStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("units.sqlite"))
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();
        (dir, SqliteSourceStore::new(pool))
    }

    #[tokio::test]
    async fn test_upsert_and_fetch_round_trip() {
        let (_dir, store) = store().await;
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let mut entity = MetadataEntity::new("unit", "cpu", "High CPU", ts)
            .with_resource("Microsoft.Web", "sites");
        entity.dependencies = vec!["util".into()];
        entity.support_topics = vec![SupportTopic {
            id: "1".into(),
            pes_id: "2".into(),
        }];
        store.upsert(&entity).await.unwrap();

        let rows = store.fetch_rows_by_category("unit", EPOCH).await.unwrap();
        assert_eq!(rows, vec![entity]);
    }

    #[tokio::test]
    async fn test_row_keys_ignore_case() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        store
            .upsert_batch(&[
                MetadataEntity::new("unit", "CpuCheck", "first", now),
                MetadataEntity::new("UNIT", "cpucheck", "second", now),
            ])
            .await
            .unwrap();
        let rows = store.fetch_rows_by_category("unit", EPOCH).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "second");
    }

    #[tokio::test]
    async fn test_fetch_since_filters_old_rows() {
        let (_dir, store) = store().await;
        let old = Utc.timestamp_opt(1_000, 0).unwrap();
        let new = Utc.timestamp_opt(2_000, 0).unwrap();
        store
            .upsert_batch(&[
                MetadataEntity::new("unit", "a", "a", old),
                MetadataEntity::new("unit", "b", "b", new),
                MetadataEntity::new("fragment", "f", "f", new),
            ])
            .await
            .unwrap();
        let rows = store.fetch_rows_by_category("unit", new).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_key, "b");
    }
}
