//! Filesystem [`BlobStore`].
//!
//! A blob `name` in `container` lives at `<root>/<container>/<name>`.
//! Names may contain `/` separators but never `..` or absolute parts.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use unit_harness_core::store::{BlobStore, DEFAULT_CONTAINER};

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        for part in [container, name] {
            let path = Path::new(part);
            if part.is_empty()
                || path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            {
                bail!("Invalid blob path segment: '{}'", part);
            }
        }
        Ok(self.root.join(container).join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get_bytes_by_name(
        &self,
        name: &str,
        container: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(container.unwrap_or(DEFAULT_CONTAINER), name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob {}", path.display())),
        }
    }

    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(DEFAULT_CONTAINER, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", path.display()))?;
        Ok(())
    }
}
