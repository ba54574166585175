//! Collaborator interfaces consumed by the harness.
//!
//! Storage drivers and source control are out of the harness's hands; it
//! talks to them through three narrow traits so backends stay pluggable
//! (SQLite and filesystem in the `unit-harness` crate, in-memory here).
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`SourceStore`] | Durable metadata entity rows, fetched by category and modification time |
//! | [`BlobStore`] | Compiled artifact bytes by name |
//! | [`UnitSourceResolver`] | Current source text of a unit or fragment |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{MetadataEntity, UnitKind, UnitSource};

/// The "since epoch" sentinel: fetch every row regardless of age.
pub const EPOCH: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Container artifacts are written to when none is named.
pub const DEFAULT_CONTAINER: &str = "units";

/// Blob name of a compiled artifact, lower-cased: `<id>/<id>.luac` for
/// units and `<id>/<id>.fragment.luac` for fragments, so a unit and a
/// fragment sharing an id never overwrite each other.
pub fn artifact_blob_name(kind: UnitKind, id: &str) -> String {
    let id = id.to_lowercase();
    match kind {
        UnitKind::Unit => format!("{}/{}.luac", id, id),
        UnitKind::Fragment => format!("{}/{}.fragment.luac", id, id),
    }
}

/// Durable store of [`MetadataEntity`] rows partitioned by category.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Rows of `category` modified at or after `modified_since`.
    ///
    /// Passing [`EPOCH`] returns every row of the category.
    async fn fetch_rows_by_category(
        &self,
        category: &str,
        modified_since: DateTime<Utc>,
    ) -> Result<Vec<MetadataEntity>>;

    /// Insert or replace one row, keyed by `(partition_key, row_key)`.
    async fn upsert(&self, entity: &MetadataEntity) -> Result<()>;

    /// Insert or replace several rows.
    async fn upsert_batch(&self, entities: &[MetadataEntity]) -> Result<()> {
        for entity in entities {
            self.upsert(entity).await?;
        }
        Ok(())
    }
}

/// Byte storage for compiled artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bytes stored under `name`, or `None` if absent. `container`
    /// defaults to [`DEFAULT_CONTAINER`].
    async fn get_bytes_by_name(&self, name: &str, container: Option<&str>)
        -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `name` in the default container, replacing any
    /// previous content.
    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// Resolves the current source of a unit or fragment by identifier.
///
/// Units and fragments are separate namespaces; the same id may name one
/// of each.
#[async_trait]
pub trait UnitSourceResolver: Send + Sync {
    async fn resolve(&self, kind: UnitKind, id: &str) -> Result<Option<UnitSource>>;
}
