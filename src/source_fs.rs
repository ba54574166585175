//! Filesystem [`UnitSourceResolver`].
//!
//! Layout under the configured root:
//!
//! ```text
//! units/<id>.lua            a unit
//! units/<id>/unit.lua       a unit kept in its own directory
//! fragments/<name>.lua      a shared fragment
//! ```
//!
//! Leading `-- @reference <name>` comment lines declare fragment
//! references; the compiler adds every literal `require("<name>")`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use unit_harness_core::models::{UnitKind, UnitSource};
use unit_harness_core::store::UnitSourceResolver;

use crate::config::Config;

pub struct FsSourceResolver {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl FsSourceResolver {
    pub fn new(root: impl Into<PathBuf>, include_globs: &[String]) -> Result<Self> {
        let exclude = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        Ok(Self {
            root: root.into(),
            include: build_globset(include_globs)?,
            exclude: build_globset(&exclude)?,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.units.dir, &config.units.include_globs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every unit and fragment under the root, sorted by kind then id.
    pub fn scan(&self) -> Result<Vec<UnitSource>> {
        if !self.root.exists() {
            bail!("Units directory does not exist: {}", self.root.display());
        }

        let mut sources = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            if let Some((id, kind)) = classify(relative) {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                sources.push(build_source(id, kind, text));
            }
        }

        sources.sort_by(|a, b| {
            (b.kind == UnitKind::Fragment)
                .cmp(&(a.kind == UnitKind::Fragment))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sources)
    }
}

#[async_trait]
impl UnitSourceResolver for FsSourceResolver {
    async fn resolve(&self, kind: UnitKind, id: &str) -> Result<Option<UnitSource>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|s| s.kind == kind && s.id.eq_ignore_ascii_case(id)))
    }
}

/// Load a single file as a unit source. Files under a `fragments`
/// directory are fragments; anything else is a unit.
pub fn load_source_file(path: &Path) -> Result<UnitSource> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let (id, kind) = classify(path)
        .or_else(|| {
            path.file_stem()
                .map(|s| (s.to_string_lossy().to_string(), UnitKind::Unit))
        })
        .with_context(|| format!("Cannot derive a unit id from {}", path.display()))?;
    Ok(build_source(id, kind, text))
}

fn build_source(id: String, kind: UnitKind, text: String) -> UnitSource {
    let references = declared_references(&text);
    let source = match kind {
        UnitKind::Unit => UnitSource::unit(id, text),
        UnitKind::Fragment => UnitSource::fragment(id, text),
    };
    source.with_references(references)
}

/// Identify a `.lua` file by its position in the layout.
fn classify(path: &Path) -> Option<(String, UnitKind)> {
    if path.extension().and_then(|e| e.to_str()) != Some("lua") {
        return None;
    }
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    let stem = path.file_stem()?.to_string_lossy().to_string();

    let n = parts.len();
    if n >= 2 && parts[n - 2] == "fragments" {
        return Some((stem, UnitKind::Fragment));
    }
    if n >= 2 && parts[n - 2] == "units" {
        return Some((stem, UnitKind::Unit));
    }
    if n >= 3 && parts[n - 3] == "units" && stem == "unit" {
        return Some((parts[n - 2].clone(), UnitKind::Unit));
    }
    None
}

/// Names from leading `-- @reference a, b` comment lines.
fn declared_references(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix("--") else {
            break;
        };
        if let Some(list) = comment.trim().strip_prefix("@reference") {
            for name in list.split(|c: char| c == ',' || c.is_whitespace()) {
                if !name.is_empty() && !names.iter().any(|n: &String| n == name) {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn resolver(root: &Path) -> FsSourceResolver {
        FsSourceResolver::new(root, &["**/*.lua".to_string()]).unwrap()
    }

    #[test]
    fn test_scan_layout() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "units/cpu.lua", "-- @reference util\nreturn 1");
        write(dir.path(), "units/memory/unit.lua", "return 2");
        write(dir.path(), "fragments/util.lua", "return {}");
        write(dir.path(), "units/notes.txt", "ignored");
        write(dir.path(), "misc/other.lua", "ignored");

        let sources = resolver(dir.path()).scan().unwrap();
        let ids: Vec<(&str, UnitKind)> = sources.iter().map(|s| (s.id.as_str(), s.kind)).collect();
        assert_eq!(
            ids,
            vec![
                ("util", UnitKind::Fragment),
                ("cpu", UnitKind::Unit),
                ("memory", UnitKind::Unit),
            ]
        );
        assert_eq!(sources[1].references, vec!["util"]);
    }

    #[tokio::test]
    async fn test_resolve_ignores_case() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "units/CpuCheck.lua", "return 1");
        let r = resolver(dir.path());
        assert!(r.resolve(UnitKind::Unit, "cpucheck").await.unwrap().is_some());
        assert!(r.resolve(UnitKind::Unit, "missing").await.unwrap().is_none());
        assert!(r.resolve(UnitKind::Fragment, "cpucheck").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_unit_and_fragment_with_same_id() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "units/cpu.lua", "return 'unit'");
        write(dir.path(), "fragments/cpu.lua", "return 'fragment'");
        let r = resolver(dir.path());
        let unit = r.resolve(UnitKind::Unit, "cpu").await.unwrap().unwrap();
        let fragment = r.resolve(UnitKind::Fragment, "cpu").await.unwrap().unwrap();
        assert_eq!(unit.text, "return 'unit'");
        assert_eq!(fragment.text, "return 'fragment'");
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolver(&dir.path().join("nope")).scan().is_err());
    }

    #[test]
    fn test_declared_references_stop_at_code() {
        let text = "-- header\n-- @reference a, b\n--@reference c\n\nlocal x = 1\n-- @reference late\n";
        assert_eq!(declared_references(text), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_load_source_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "anywhere/latency.lua", "return 1");
        let source = load_source_file(&dir.path().join("anywhere/latency.lua")).unwrap();
        assert_eq!(source.id, "latency");
        assert_eq!(source.kind, UnitKind::Unit);
    }
}
