//! Compile, validate and invoke Lua diagnostic units.
//!
//! # Compilation
//!
//! 1. Resolve every fragment the source references (declared references
//!    plus each `require("name")` found in the text), transitively.
//! 2. Compile the fragments and the main chunk to Lua functions.
//! 3. Count `unit.run` declarations in the source text. More than one is
//!    [`CompileErrorKind::DuplicateEntryPoint`].
//! 4. Run the top level in a sandboxed VM with the fragments registered in
//!    `package.preload`, bounded by the compile timeout.
//! 5. Read the global `unit` table back as [`UnitMetadata`] and validate it.
//!
//! Failures never escape as errors: [`UnitCompiler::compile`] always
//! returns a [`CompiledUnit`], failed ones carrying diagnostics.
//!
//! # Artifacts
//!
//! An artifact is a JSON bundle holding base64 Lua bytecode for the main
//! chunk and every fragment it needs. The module bundle is stripped; the
//! debug bundle keeps line information. Either can be handed back to
//! [`UnitCompiler::load_artifact`].
//!
//! # Invocation
//!
//! Each call gets a fresh VM. Arguments bind by position to the declared
//! `parameters`; the resource context is exposed as the global `context`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use mlua::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use unit_harness_core::models::{ParameterSpec, ResourceContext, UnitKind, UnitMetadata, UnitSource};

use crate::error::{CompileErrorKind, UnitError};
use crate::lua_runtime::{
    json_type_name, json_value_to_lua, lua_value_to_json, new_vm, register_all_host_apis,
    HostOptions,
};
use crate::unit::{CompiledUnit, Diagnostic, UnitArtifact};

const BUNDLE_VERSION: u32 = 1;

/// Parameter types a unit may declare.
pub const PARAMETER_TYPES: &[&str] = &["any", "string", "integer", "number", "boolean", "array", "object"];

/// Turns unit sources into invokable [`CompiledUnit`]s.
pub trait UnitCompiler: Send + Sync {
    /// Compile `source`. `fragments` maps fragment names to their source
    /// text; names are matched case-insensitively.
    fn compile(&self, source: &UnitSource, fragments: &HashMap<String, String>) -> CompiledUnit;

    /// Rehydrate a unit from artifact bytes produced by this compiler.
    fn load_artifact(&self, id: &str, bytes: &[u8]) -> Result<CompiledUnit, UnitError>;

    /// Run a ready unit's entry point with positional `args`.
    fn invoke(
        &self,
        unit: &CompiledUnit,
        args: Vec<Value>,
        context: Option<&ResourceContext>,
        deadline: Option<Instant>,
    ) -> Result<Value, UnitError>;

    fn artifact_bytes(&self, unit: &CompiledUnit) -> Result<(Vec<u8>, Vec<u8>), UnitError> {
        unit.artifact_bytes()
    }

    fn save_artifact_to_path(&self, unit: &CompiledUnit, path: &Path) -> Result<(), UnitError> {
        unit.save_artifact_to_path(path)
    }
}

/// On-disk form of a compiled unit.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactBundle {
    version: u32,
    id: String,
    kind: UnitKind,
    /// Entry point declared as `function unit:run(...)`.
    #[serde(default)]
    method_entry: bool,
    main: String,
    #[serde(default)]
    fragments: BTreeMap<String, String>,
}

struct Failure {
    kind: CompileErrorKind,
    diagnostics: Vec<Diagnostic>,
}

impl Failure {
    fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            diagnostics: vec![Diagnostic::error(message)],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lua compiler
// ═══════════════════════════════════════════════════════════════════════

/// The Lua 5.4 implementation of [`UnitCompiler`].
pub struct LuaUnitCompiler {
    host: HostOptions,
    compile_timeout: Duration,
}

impl LuaUnitCompiler {
    pub fn new(host: HostOptions, compile_timeout: Duration) -> Self {
        Self {
            host,
            compile_timeout,
        }
    }

    fn sandbox(&self, unit_name: &str) -> LuaResult<Lua> {
        let lua = new_vm();
        register_all_host_apis(&lua, unit_name, &self.host)?;
        Ok(lua)
    }

    fn try_compile(
        &self,
        source: &UnitSource,
        fragments: &HashMap<String, String>,
    ) -> Result<(CompiledUnit, Vec<String>), Failure> {
        let resolved = resolve_fragments(source, fragments)?;

        let lua = self
            .sandbox(&source.id)
            .map_err(|e| Failure::new(CompileErrorKind::Script, format!("failed to create VM: {}", e)))?;

        let mut chunks = Vec::with_capacity(resolved.len());
        for (name, text) in &resolved {
            let function = lua
                .load(text.as_str())
                .set_name(format!("@fragments/{}", name))
                .into_function()
                .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?;
            chunks.push((name.clone(), function));
        }

        let main = lua
            .load(source.text.as_str())
            .set_name(format!("@{}", source.id))
            .into_function()
            .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?;

        let mut method_entry = false;
        if source.kind == UnitKind::Unit {
            let tokens = lex(&source.text);
            let entries = entry_points(&tokens);
            if entries.len() > 1 {
                return Err(Failure::new(
                    CompileErrorKind::DuplicateEntryPoint,
                    format!("found {} declarations of unit.run; exactly one is allowed", entries.len()),
                ));
            }
            method_entry = entries.first().copied().unwrap_or(false);
        }

        let (metadata, diagnostics) =
            self.evaluate(&lua, &source.id, source.kind, &main, &chunks)?;

        let bundle = |strip: bool| {
            let b = ArtifactBundle {
                version: BUNDLE_VERSION,
                id: source.id.clone(),
                kind: source.kind,
                method_entry,
                main: STANDARD.encode(main.dump(strip)),
                fragments: chunks
                    .iter()
                    .map(|(name, f)| (name.clone(), STANDARD.encode(f.dump(strip))))
                    .collect(),
            };
            serde_json::to_vec(&b)
        };
        let artifact = UnitArtifact {
            module: bundle(true)
                .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?,
            debug: bundle(false)
                .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?,
        };

        let references: Vec<String> = resolved.into_iter().map(|(name, _)| name).collect();
        let unit = CompiledUnit::ready(source.id.clone(), source.kind, metadata, artifact, diagnostics)
            .with_source_hash(source.content_hash())
            .with_references(references.clone());
        Ok((unit, references))
    }

    /// Run the top level, then read back and validate the metadata.
    fn evaluate(
        &self,
        lua: &Lua,
        id: &str,
        kind: UnitKind,
        main: &LuaFunction,
        fragments: &[(String, LuaFunction)],
    ) -> Result<(UnitMetadata, Vec<Diagnostic>), Failure> {
        install_fragments(lua, fragments)
            .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?;

        let expired = arm_deadline(lua, Instant::now() + self.compile_timeout);
        let run = main.call::<LuaMultiValue>(());
        lua.remove_hook();
        if let Err(e) = run {
            let message = if expired.load(Ordering::SeqCst) {
                format!(
                    "top level did not finish within {} seconds",
                    self.compile_timeout.as_secs()
                )
            } else {
                e.to_string()
            };
            return Err(Failure::new(CompileErrorKind::Script, message));
        }

        match kind {
            UnitKind::Fragment => Ok((UnitMetadata::for_fragment(id), Vec::new())),
            UnitKind::Unit => {
                let metadata = extract_metadata(lua)?;
                let diagnostics = validate_metadata(id, &metadata)?;
                Ok((metadata, diagnostics))
            }
        }
    }

    fn load_bundle(&self, lua: &Lua, bundle: &ArtifactBundle) -> anyhow::Result<(LuaFunction, Vec<(String, LuaFunction)>)> {
        let mut fragments = Vec::with_capacity(bundle.fragments.len());
        for (name, encoded) in &bundle.fragments {
            let bytes = STANDARD.decode(encoded)?;
            let function = lua
                .load(&bytes[..])
                .set_name(format!("@fragments/{}", name))
                .set_mode(mlua::ChunkMode::Binary)
                .into_function()
                .map_err(|e| anyhow::anyhow!("fragment '{}': {}", name, e))?;
            fragments.push((name.clone(), function));
        }
        let bytes = STANDARD.decode(&bundle.main)?;
        let main = lua
            .load(&bytes[..])
            .set_name(format!("@{}", bundle.id))
            .set_mode(mlua::ChunkMode::Binary)
            .into_function()
            .map_err(|e| anyhow::anyhow!("main chunk: {}", e))?;
        Ok((main, fragments))
    }
}

impl Default for LuaUnitCompiler {
    fn default() -> Self {
        Self::new(HostOptions::default(), Duration::from_secs(10))
    }
}

impl UnitCompiler for LuaUnitCompiler {
    fn compile(&self, source: &UnitSource, fragments: &HashMap<String, String>) -> CompiledUnit {
        let started = Instant::now();
        match self.try_compile(source, fragments) {
            Ok((unit, references)) => {
                debug!(
                    unit_id = %source.id,
                    references = references.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "compiled unit"
                );
                unit
            }
            Err(failure) => {
                warn!(
                    unit_id = %source.id,
                    kind = %failure.kind,
                    diagnostics = ?failure.diagnostics.iter().map(|d| d.message.as_str()).collect::<Vec<_>>(),
                    "compilation failed"
                );
                CompiledUnit::failed(source.id.clone(), source.kind, failure.kind, failure.diagnostics)
                    .with_source_hash(source.content_hash())
            }
        }
    }

    fn load_artifact(&self, id: &str, bytes: &[u8]) -> Result<CompiledUnit, UnitError> {
        let bundle: ArtifactBundle = serde_json::from_slice(bytes)
            .map_err(|e| UnitError::Internal(anyhow::anyhow!("artifact for '{}' is not a bundle: {}", id, e)))?;
        if bundle.version != BUNDLE_VERSION {
            return Err(UnitError::Internal(anyhow::anyhow!(
                "artifact for '{}' has unsupported version {}",
                id,
                bundle.version
            )));
        }

        let kind = bundle.kind;
        let lua = self.sandbox(id).map_err(|e| UnitError::Internal(anyhow::anyhow!("{}", e)))?;
        let (main, fragments) = self
            .load_bundle(&lua, &bundle)
            .map_err(|e| UnitError::Internal(e.context(format!("Failed to load artifact for '{}'", id))))?;

        match self.evaluate(&lua, id, kind, &main, &fragments) {
            Ok((metadata, diagnostics)) => {
                let artifact = UnitArtifact {
                    module: bytes.to_vec(),
                    debug: bytes.to_vec(),
                };
                Ok(CompiledUnit::ready(id, kind, metadata, artifact, diagnostics)
                    .with_references(bundle.fragments.keys().cloned().collect()))
            }
            Err(failure) => Err(UnitError::Compilation {
                unit_id: id.to_string(),
                kind: failure.kind,
                diagnostics: failure.diagnostics.into_iter().map(|d| d.message).collect(),
            }),
        }
    }

    fn invoke(
        &self,
        unit: &CompiledUnit,
        args: Vec<Value>,
        context: Option<&ResourceContext>,
        deadline: Option<Instant>,
    ) -> Result<Value, UnitError> {
        unit.ensure_ready()?;

        if unit.kind == UnitKind::Fragment {
            unit.record_invocation();
            return Ok(args.into_iter().next().unwrap_or(Value::Null));
        }

        let parameters = unit
            .metadata
            .as_ref()
            .map(|m| m.parameters.as_slice())
            .unwrap_or(&[]);
        let args = bind_arguments(&unit.id, parameters, args)?;

        let (module, _) = unit.artifact_bytes()?;
        let bundle: ArtifactBundle = serde_json::from_slice(&module)
            .map_err(|e| UnitError::Internal(anyhow::anyhow!("corrupt artifact for '{}': {}", unit.id, e)))?;

        let execution = |e: LuaError| UnitError::Execution {
            unit_id: unit.id.clone(),
            source: anyhow::anyhow!("{}", e),
        };

        let lua = self.sandbox(unit.display_name()).map_err(execution)?;
        let (main, fragments) = self
            .load_bundle(&lua, &bundle)
            .map_err(|e| UnitError::Internal(e.context(format!("Failed to load artifact for '{}'", unit.id))))?;
        install_fragments(&lua, &fragments).map_err(execution)?;

        if let Some(ctx) = context {
            let value = serde_json::to_value(ctx).map_err(|e| UnitError::Internal(e.into()))?;
            let table = json_value_to_lua(&lua, &value).map_err(execution)?;
            lua.globals().set("context", table).map_err(execution)?;
        }

        let expired = deadline.map(|d| arm_deadline(&lua, d));
        let timed_out = || {
            expired
                .as_ref()
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
        };

        let result = (|| -> LuaResult<LuaValue> {
            main.call::<LuaMultiValue>(())?;
            let table: LuaTable = lua.globals().get("unit")?;
            let run: LuaFunction = table.get("run")?;

            let mut values = Vec::with_capacity(args.len() + 1);
            if bundle.method_entry {
                values.push(LuaValue::Table(table));
            }
            for arg in &args {
                values.push(json_value_to_lua(&lua, arg)?);
            }
            run.call::<LuaValue>(LuaMultiValue::from_vec(values))
        })();

        let value = match result {
            Ok(value) => value,
            Err(_) if timed_out() => {
                return Err(UnitError::DeadlineExceeded {
                    unit_id: unit.id.clone(),
                })
            }
            Err(e) => return Err(execution(e)),
        };

        let json = lua_value_to_json(value).map_err(execution)?;
        unit.record_invocation();
        Ok(json)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// VM plumbing
// ═══════════════════════════════════════════════════════════════════════

fn install_fragments(lua: &Lua, fragments: &[(String, LuaFunction)]) -> LuaResult<()> {
    let package: LuaTable = lua.globals().get("package")?;
    let preload: LuaTable = package.get("preload")?;
    for (name, function) in fragments {
        preload.set(name.as_str(), function.clone())?;
    }
    Ok(())
}

/// Abort execution once `deadline` passes. The returned flag is set when
/// the hook fired.
fn arm_deadline(lua: &Lua, deadline: Instant) -> Arc<AtomicBool> {
    let expired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&expired);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                flag.store(true, Ordering::SeqCst);
                Err(mlua::Error::RuntimeError("deadline exceeded".to_string()))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );
    expired
}

fn extract_metadata(lua: &Lua) -> Result<UnitMetadata, Failure> {
    let value: LuaValue = lua
        .globals()
        .get("unit")
        .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?;
    let table = match value {
        LuaValue::Table(t) => t,
        _ => {
            return Err(Failure::new(
                CompileErrorKind::MissingEntryPoint,
                "script does not define a global `unit` table",
            ))
        }
    };

    let run: LuaValue = table
        .get("run")
        .map_err(|e| Failure::new(CompileErrorKind::Script, e.to_string()))?;
    if !run.is_function() {
        return Err(Failure::new(
            CompileErrorKind::MissingEntryPoint,
            "`unit.run` is not defined as a function",
        ));
    }

    let json = lua_value_to_json(LuaValue::Table(table))
        .map_err(|e| Failure::new(CompileErrorKind::InvalidMetadata, e.to_string()))?;
    serde_json::from_value(json)
        .map_err(|e| Failure::new(CompileErrorKind::InvalidMetadata, format!("malformed `unit` table: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════

const ILLEGAL_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn has_illegal_chars(s: &str) -> bool {
    s.chars().any(|c| ILLEGAL_NAME_CHARS.contains(&c) || c.is_control())
}

/// Check a unit's declared metadata. Returns warnings on success.
fn validate_metadata(source_id: &str, metadata: &UnitMetadata) -> Result<Vec<Diagnostic>, Failure> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let definition = &metadata.definition;

    if definition.id.trim().is_empty() {
        errors.push("definition.id must not be empty".to_string());
    } else if has_illegal_chars(&definition.id) {
        errors.push(format!("definition.id '{}' contains characters not allowed in a file name", definition.id));
    } else if !definition.id.eq_ignore_ascii_case(source_id) {
        warnings.push(format!(
            "definition.id '{}' differs from the source identifier '{}'",
            definition.id, source_id
        ));
    }
    if definition.name.trim().is_empty() {
        errors.push("definition.name must not be empty".to_string());
    }
    if definition.author.trim().is_empty() {
        errors.push("definition.author must not be empty".to_string());
    } else if has_illegal_chars(&definition.author) {
        errors.push(format!("definition.author '{}' contains characters not allowed in a file name", definition.author));
    }

    for (i, topic) in metadata.support_topics.iter().enumerate() {
        if topic.id.trim().is_empty() || topic.pes_id.trim().is_empty() {
            errors.push(format!("support_topics[{}] needs both id and pes_id", i + 1));
        }
    }

    match (&metadata.resource_filter, &metadata.system_filter) {
        (Some(_), Some(_)) => {
            errors.push("a unit cannot declare both resource_filter and system_filter".to_string())
        }
        (Some(filter), None) => {
            for field in filter.empty_criteria() {
                errors.push(format!("resource_filter.{} must not be empty", field));
            }
        }
        _ => {}
    }

    for p in &metadata.parameters {
        if p.name.trim().is_empty() {
            errors.push("parameters need a name".to_string());
        }
        if !PARAMETER_TYPES.contains(&p.param_type.as_str()) {
            errors.push(format!("parameter '{}' has unknown type '{}'", p.name, p.param_type));
        }
    }

    if metadata.internal_only() && !metadata.support_topics.is_empty() {
        warnings.push("support topics on an internal-only unit are never shown to external clients".to_string());
    }

    if errors.is_empty() {
        Ok(warnings.into_iter().map(Diagnostic::warning).collect())
    } else {
        let mut diagnostics: Vec<Diagnostic> = errors.into_iter().map(Diagnostic::error).collect();
        diagnostics.extend(warnings.into_iter().map(Diagnostic::warning));
        Err(Failure {
            kind: CompileErrorKind::InvalidMetadata,
            diagnostics,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Argument binding
// ═══════════════════════════════════════════════════════════════════════

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Bind positional `args` to `parameters`.
///
/// Surplus arguments are dropped. Missing optional arguments become
/// `null`. Positions in errors are zero-based. A unit declaring no
/// parameters receives the arguments unchanged.
pub fn bind_arguments(
    unit_id: &str,
    parameters: &[ParameterSpec],
    mut args: Vec<Value>,
) -> Result<Vec<Value>, UnitError> {
    if parameters.is_empty() {
        return Ok(args);
    }
    args.truncate(parameters.len());

    let mut bound = Vec::with_capacity(parameters.len());
    let mut supplied = args.into_iter();
    for (position, param) in parameters.iter().enumerate() {
        let binding_error = |found: &str| UnitError::ArgumentBinding {
            unit_id: unit_id.to_string(),
            position,
            name: param.name.clone(),
            expected: param.param_type.clone(),
            found: found.to_string(),
        };
        match supplied.next() {
            None if param.required => return Err(binding_error("nothing")),
            Some(Value::Null) if param.required => return Err(binding_error("null")),
            None | Some(Value::Null) => bound.push(Value::Null),
            Some(value) => {
                if !type_matches(&param.param_type, &value) {
                    return Err(binding_error(json_type_name(&value)));
                }
                bound.push(value);
            }
        }
    }
    Ok(bound)
}

// ═══════════════════════════════════════════════════════════════════════
// Source scanning
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Punct(char),
}

/// Tokenize Lua source, dropping comments and numbers.
fn lex(src: &str) -> Vec<Token> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            i += 2;
            if let Some((level, start)) = long_bracket_open(&chars, i) {
                i = long_bracket_close(&chars, start, level).1;
            } else {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
        } else if c == '"' || c == '\'' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != c && chars[i] != '\n' {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    s.push(chars[i + 1]);
                    i += 2;
                } else {
                    s.push(chars[i]);
                    i += 1;
                }
            }
            i += 1;
            tokens.push(Token::Str(s));
        } else if let Some((level, start)) = (c == '[').then(|| long_bracket_open(&chars, i)).flatten() {
            let (content, next) = long_bracket_close(&chars, start, level);
            tokens.push(Token::Str(content));
            i = next;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }
    tokens
}

/// If `chars[i..]` opens a long bracket (`[[`, `[==[`), return its level
/// and the index just past it.
fn long_bracket_open(chars: &[char], i: usize) -> Option<(usize, usize)> {
    if chars.get(i) != Some(&'[') {
        return None;
    }
    let mut j = i + 1;
    while chars.get(j) == Some(&'=') {
        j += 1;
    }
    (chars.get(j) == Some(&'[')).then_some((j - i - 1, j + 1))
}

/// Read up to the matching close bracket; returns the content and the
/// index just past the close.
fn long_bracket_close(chars: &[char], start: usize, level: usize) -> (String, usize) {
    let mut j = start;
    while j < chars.len() {
        if chars[j] == ']' {
            let mut k = j + 1;
            while chars.get(k) == Some(&'=') {
                k += 1;
            }
            if k - j - 1 == level && chars.get(k) == Some(&']') {
                return (chars[start..j].iter().collect(), k + 1);
            }
        }
        j += 1;
    }
    (chars[start..].iter().collect(), chars.len())
}

fn is_ident(token: Option<&Token>, name: &str) -> bool {
    matches!(token, Some(Token::Ident(s)) if s == name)
}

fn is_punct(token: Option<&Token>, c: char) -> bool {
    matches!(token, Some(Token::Punct(p)) if *p == c)
}

/// Every `unit.run` declaration, `true` for the `unit:run` method form.
fn entry_points(tokens: &[Token]) -> Vec<bool> {
    let mut found = Vec::new();
    for i in 0..tokens.len() {
        if !is_ident(tokens.get(i), "unit") {
            continue;
        }
        let qualified = i > 0 && (is_punct(tokens.get(i - 1), '.') || is_punct(tokens.get(i - 1), ':'));
        if qualified {
            continue;
        }
        if is_punct(tokens.get(i + 1), '=') && is_punct(tokens.get(i + 2), '{') {
            found.extend(constructor_entry_points(&tokens[i + 3..]));
            continue;
        }
        if !is_ident(tokens.get(i + 2), "run") {
            continue;
        }
        let dot = is_punct(tokens.get(i + 1), '.');
        let colon = is_punct(tokens.get(i + 1), ':');
        let declared_with_function = i > 0 && is_ident(tokens.get(i - 1), "function");

        if declared_with_function && (dot || colon) && is_punct(tokens.get(i + 3), '(') {
            found.push(colon);
        } else if dot
            && is_punct(tokens.get(i + 3), '=')
            && !is_punct(tokens.get(i + 4), '=')
            && is_ident(tokens.get(i + 4), "function")
        {
            found.push(false);
        }
    }
    found
}

/// `run = function` fields at the top level of a `unit = { ... }`
/// constructor. `tokens` starts just past the opening brace.
fn constructor_entry_points(tokens: &[Token]) -> Vec<bool> {
    let mut found = Vec::new();
    let mut depth = 1usize;
    for (j, token) in tokens.iter().enumerate() {
        match token {
            Token::Punct('{') => depth += 1,
            Token::Punct('}') => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Token::Ident(name) if depth == 1 && name == "run" => {
                let starts_field =
                    j == 0 || is_punct(tokens.get(j - 1), ',') || is_punct(tokens.get(j - 1), ';');
                if starts_field
                    && is_punct(tokens.get(j + 1), '=')
                    && is_ident(tokens.get(j + 2), "function")
                {
                    found.push(false);
                }
            }
            _ => {}
        }
    }
    found
}

/// Module names passed to `require` with a literal argument.
pub fn referenced_modules(src: &str) -> Vec<String> {
    let tokens = lex(src);
    let mut names = Vec::new();
    for i in 0..tokens.len() {
        if !is_ident(tokens.get(i), "require") {
            continue;
        }
        let arg = if is_punct(tokens.get(i + 1), '(') {
            tokens.get(i + 2)
        } else {
            tokens.get(i + 1)
        };
        if let Some(Token::Str(name)) = arg {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    names
}

/// Resolve the fragments `source` needs, following fragments' own
/// `require`s. Returned in first-reference order.
fn resolve_fragments(
    source: &UnitSource,
    fragments: &HashMap<String, String>,
) -> Result<Vec<(String, String)>, Failure> {
    let by_name: HashMap<String, &String> = fragments
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let mut pending: Vec<String> = source.references.clone();
    for name in referenced_modules(&source.text) {
        if !pending.iter().any(|p| p.eq_ignore_ascii_case(&name)) {
            pending.push(name);
        }
    }
    pending.reverse();

    let is_self = |name: &str| source.kind == UnitKind::Fragment && name.eq_ignore_ascii_case(&source.id);
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    let mut missing = Vec::new();
    while let Some(name) = pending.pop() {
        if is_self(&name) || !seen.insert(name.to_lowercase()) {
            continue;
        }
        match by_name.get(&name.to_lowercase()) {
            Some(text) => {
                for nested in referenced_modules(text).into_iter().rev() {
                    pending.push(nested);
                }
                resolved.push((name, (*text).clone()));
            }
            None => missing.push(name),
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(Failure {
            kind: CompileErrorKind::UnresolvedReference,
            diagnostics: missing
                .into_iter()
                .map(|name| Diagnostic::error(format!("unresolved reference '{}'", name)))
                .collect(),
        })
    }
}
