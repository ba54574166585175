//! The compiled form of a unit and its lifecycle states.
//!
//! A [`CompiledUnit`] is produced once by a compiler and never mutated
//! afterwards, apart from its invocation counter. Caches hand out
//! `Arc<CompiledUnit>`, so a lookup always sees either a fully compiled
//! unit or nothing.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use unit_harness_core::models::{UnitKind, UnitMetadata};

use crate::error::{CompileErrorKind, UnitError};

/// Lifecycle state of a unit.
///
/// `Uninitialized → Compiling → {CompilationFailed | Ready}`, then
/// `Ready → Invoked` and `Invoked → Invoked` any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Uninitialized,
    Compiling,
    CompilationFailed,
    Ready,
    Invoked,
}

impl UnitState {
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Uninitialized, Compiling)
                | (Compiling, CompilationFailed)
                | (Compiling, Ready)
                | (Ready, Invoked)
                | (Invoked, Invoked)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A human-readable compiler message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "error: {}", self.message),
            Severity::Warning => write!(f, "warning: {}", self.message),
        }
    }
}

/// Serialized bytecode bundles for a compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitArtifact {
    /// Bundle with debug information stripped.
    pub module: Vec<u8>,
    /// Bundle keeping line information.
    pub debug: Vec<u8>,
}

/// Outcome of compiling one unit source.
#[derive(Debug)]
pub struct CompiledUnit {
    pub id: String,
    pub kind: UnitKind,
    /// Set when compilation failed.
    pub failure: Option<CompileErrorKind>,
    pub diagnostics: Vec<Diagnostic>,
    pub metadata: Option<UnitMetadata>,
    pub artifact: Option<UnitArtifact>,
    /// Identifiers of the fragments compiled into this unit.
    pub references: Vec<String>,
    /// Hash of the source the unit was compiled from; empty when it was
    /// loaded from an artifact.
    pub source_hash: String,
    pub compiled_at: DateTime<Utc>,
    invocations: AtomicU64,
}

impl CompiledUnit {
    pub fn ready(
        id: impl Into<String>,
        kind: UnitKind,
        metadata: UnitMetadata,
        artifact: UnitArtifact,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            failure: None,
            diagnostics,
            metadata: Some(metadata),
            artifact: Some(artifact),
            references: Vec::new(),
            source_hash: String::new(),
            compiled_at: Utc::now(),
            invocations: AtomicU64::new(0),
        }
    }

    /// A unit that failed to compile. `diagnostics` must not be empty; a
    /// generic message is added when it is.
    pub fn failed(
        id: impl Into<String>,
        kind: UnitKind,
        failure: CompileErrorKind,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Self {
        if !diagnostics.iter().any(|d| d.severity == Severity::Error) {
            diagnostics.push(Diagnostic::error(failure.to_string()));
        }
        Self {
            id: id.into(),
            kind,
            failure: Some(failure),
            diagnostics,
            metadata: None,
            artifact: None,
            references: Vec::new(),
            source_hash: String::new(),
            compiled_at: Utc::now(),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn with_source_hash(mut self, hash: impl Into<String>) -> Self {
        self.source_hash = hash.into();
        self
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn with_metadata(mut self, metadata: UnitMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_compilation_successful(&self) -> bool {
        self.failure.is_none()
    }

    pub fn state(&self) -> UnitState {
        match self.failure {
            Some(_) => UnitState::CompilationFailed,
            None if self.invocation_count() > 0 => UnitState::Invoked,
            None => UnitState::Ready,
        }
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub(crate) fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Display name, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        match &self.metadata {
            Some(m) if !m.display_name().is_empty() => m.display_name(),
            _ => &self.id,
        }
    }

    /// Error diagnostics only, rendered as plain messages.
    pub fn error_messages(&self) -> Vec<String> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message.clone())
            .collect()
    }

    /// The compilation failure as an error, if any.
    pub fn compile_error(&self) -> Option<UnitError> {
        self.failure.map(|kind| UnitError::Compilation {
            unit_id: self.id.clone(),
            kind,
            diagnostics: self.error_messages(),
        })
    }

    /// Guard used by every operation that needs a ready unit.
    pub fn ensure_ready(&self) -> Result<(), UnitError> {
        match self.failure {
            Some(kind) => Err(UnitError::invalid_operation(
                &self.id,
                format!("unit failed to compile ({})", kind),
            )),
            None => Ok(()),
        }
    }

    /// `(module_bytes, debug_bytes)` of the compiled artifact.
    pub fn artifact_bytes(&self) -> Result<(Vec<u8>, Vec<u8>), UnitError> {
        self.ensure_ready()?;
        match &self.artifact {
            Some(a) => Ok((a.module.clone(), a.debug.clone())),
            None => Err(UnitError::invalid_operation(&self.id, "unit has no artifact")),
        }
    }

    /// Write the module bundle to `path` and the debug bundle next to it
    /// as `<path>.debug`. Neither file may already exist.
    pub fn save_artifact_to_path(&self, path: &Path) -> Result<(), UnitError> {
        let (module, debug) = self.artifact_bytes()?;
        let debug_path = debug_path_for(path);

        for target in [path, debug_path.as_path()] {
            if target.exists() {
                return Err(UnitError::invalid_operation(
                    &self.id,
                    format!("refusing to overwrite {}", target.display()),
                ));
            }
        }

        write_new(path, &module).map_err(|e| self.write_error(path, e))?;
        write_new(&debug_path, &debug).map_err(|e| self.write_error(&debug_path, e))?;
        Ok(())
    }

    fn write_error(&self, path: &Path, err: std::io::Error) -> UnitError {
        if err.kind() == std::io::ErrorKind::AlreadyExists {
            UnitError::invalid_operation(&self.id, format!("refusing to overwrite {}", path.display()))
        } else {
            UnitError::Internal(
                anyhow::Error::new(err).context(format!("Failed to write {}", path.display())),
            )
        }
    }
}

fn debug_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".debug");
    PathBuf::from(s)
}

fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_unit() -> CompiledUnit {
        CompiledUnit::ready(
            "cpu",
            UnitKind::Unit,
            UnitMetadata::for_fragment("cpu"),
            UnitArtifact {
                module: b"module".to_vec(),
                debug: b"debug".to_vec(),
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_state_transitions() {
        assert!(UnitState::Uninitialized.can_transition_to(UnitState::Compiling));
        assert!(UnitState::Compiling.can_transition_to(UnitState::Ready));
        assert!(UnitState::Ready.can_transition_to(UnitState::Invoked));
        assert!(UnitState::Invoked.can_transition_to(UnitState::Invoked));
        assert!(!UnitState::Invoked.can_transition_to(UnitState::Compiling));
        assert!(!UnitState::CompilationFailed.can_transition_to(UnitState::Invoked));
    }

    #[test]
    fn test_invocation_moves_to_invoked() {
        let unit = ready_unit();
        assert_eq!(unit.state(), UnitState::Ready);
        unit.record_invocation();
        assert_eq!(unit.state(), UnitState::Invoked);
        assert_eq!(unit.invocation_count(), 1);
    }

    #[test]
    fn test_failed_unit_always_has_diagnostics() {
        let unit = CompiledUnit::failed("x", UnitKind::Unit, CompileErrorKind::MissingEntryPoint, vec![]);
        assert_eq!(unit.state(), UnitState::CompilationFailed);
        assert_eq!(unit.error_messages(), vec!["missing entry point"]);
        assert!(matches!(
            unit.artifact_bytes(),
            Err(UnitError::InvalidOperation { .. })
        ));
        assert!(matches!(
            unit.compile_error(),
            Some(UnitError::Compilation { kind: CompileErrorKind::MissingEntryPoint, .. })
        ));
    }

    #[test]
    fn test_save_artifact_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("cpu.luac");
        let unit = ready_unit();

        unit.save_artifact_to_path(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"module");
        assert_eq!(std::fs::read(dir.path().join("out/cpu.luac.debug")).unwrap(), b"debug");

        let err = unit.save_artifact_to_path(&path).unwrap_err();
        assert!(matches!(err, UnitError::InvalidOperation { .. }));
    }
}
