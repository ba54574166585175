//! Typed errors surfaced by the unit pipeline.
//!
//! Adapters and internal plumbing use `anyhow`; anything a caller of the
//! orchestrator or compiler must branch on is a [`UnitError`] variant.
//! Compilation and argument-binding failures carry enough detail to be
//! rendered back to the unit's author.

use std::fmt;

use serde::Serialize;

use crate::retry::RetryError;

/// Why a unit failed to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileErrorKind {
    /// The script did not parse, or its top level raised an error.
    Script,
    /// No `unit.run` entry function.
    MissingEntryPoint,
    /// More than one `unit.run` declaration.
    DuplicateEntryPoint,
    /// The `unit` table is malformed or fails validation.
    InvalidMetadata,
    /// A referenced fragment was not supplied.
    UnresolvedReference,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileErrorKind::Script => "script error",
            CompileErrorKind::MissingEntryPoint => "missing entry point",
            CompileErrorKind::DuplicateEntryPoint => "duplicate entry point",
            CompileErrorKind::InvalidMetadata => "invalid metadata",
            CompileErrorKind::UnresolvedReference => "unresolved reference",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("unit '{unit_id}' failed to compile ({kind}): {}", .diagnostics.join("; "))]
    Compilation {
        unit_id: String,
        kind: CompileErrorKind,
        diagnostics: Vec<String>,
    },

    #[error("invalid operation on unit '{unit_id}': {reason}")]
    InvalidOperation { unit_id: String, reason: String },

    #[error("unit '{unit_id}' argument {position} ('{name}') expects {expected}, got {found}")]
    ArgumentBinding {
        unit_id: String,
        position: usize,
        name: String,
        expected: String,
        found: String,
    },

    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("unit '{unit_id}' exceeded its deadline")]
    DeadlineExceeded { unit_id: String },

    #[error("unit '{unit_id}' raised an error: {source}")]
    Execution {
        unit_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    DependencyFailure(#[from] RetryError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl UnitError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        UnitError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn invalid_operation(unit_id: impl Into<String>, reason: impl Into<String>) -> Self {
        UnitError::InvalidOperation {
            unit_id: unit_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            UnitError::Compilation { .. } => "compilation_error",
            UnitError::InvalidOperation { .. } => "invalid_operation",
            UnitError::ArgumentBinding { .. } => "argument_binding_error",
            UnitError::NotFound { .. } => "not_found",
            UnitError::DeadlineExceeded { .. } => "deadline_exceeded",
            UnitError::Execution { .. } => "execution_error",
            UnitError::DependencyFailure(_) => "dependency_failure",
            UnitError::Internal(_) => "internal_error",
        }
    }
}
