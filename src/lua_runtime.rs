//! Sandboxed Lua 5.4 VM setup shared by compilation and invocation.
//!
//! Every compile and every invocation gets a fresh VM on a blocking
//! thread (via [`tokio::task::spawn_blocking`]). Host functions are
//! synchronous; the `http` module drives the async client through the
//! current runtime handle.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `http` | `get`, `post` (retried on network errors and 503) |
//! | `json` | `parse`, `encode` |
//! | `log` | `info`, `warn`, `error`, `debug` (routed to `tracing`) |
//! | `base64` | `encode`, `decode` |
//! | `crypto` | `sha256`, `hmac_sha256` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile`, `dofile`, `string.dump` and
//! `package.loadlib` are removed, and the `require` search path is
//! emptied so only fragments registered in `package.preload` can be
//! loaded. The global `load` accepts text chunks only.

use std::time::Duration;

use hmac::{Hmac, Mac};
use mlua::prelude::*;
use sha2::{Digest, Sha256};

use crate::retry::{send_with_retry, RetryPolicy};

/// Settings for the host APIs of one VM.
#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Public helpers
// ═══════════════════════════════════════════════════════════════════════

/// Create a VM able to load the compiler's own bytecode.
///
/// Safe-mode VMs refuse binary chunks, so the VM is created in unsafe
/// mode with only the safe standard libraries loaded. Script code must
/// go through [`sandbox_globals`] before it runs.
pub(crate) fn new_vm() -> Lua {
    // SAFETY: binary chunks are only loaded from Rust, out of artifact
    // bundles this crate wrote. `sandbox_globals` restricts the script
    // side `load` to text and drops `string.dump`.
    unsafe { Lua::unsafe_new_with(LuaStdLib::ALL_SAFE, LuaOptions::default()) }
}

/// Sandbox the globals and register every host module.
///
/// `unit_name` is attached to log events emitted by the script.
pub(crate) fn register_all_host_apis(
    lua: &Lua,
    unit_name: &str,
    options: &HostOptions,
) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_http_api(lua, options)?;
    register_json_api(lua)?;
    register_log_api(lua, unit_name)?;
    register_base64_api(lua)?;
    register_crypto_api(lua)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;

    if let Ok(package) = globals.get::<LuaTable>("package") {
        package.set("path", "")?;
        package.set("cpath", "")?;
        package.set("loadlib", LuaValue::Nil)?;
    }
    if let Ok(string) = globals.get::<LuaTable>("string") {
        string.set("dump", LuaValue::Nil)?;
    }

    // load(chunk, name, mode, env) with mode pinned to "t". The argument
    // count is preserved so an absent env keeps meaning the globals.
    let raw_load: LuaFunction = globals.get("load")?;
    let text_only = lua.create_function(move |lua, mut args: LuaMultiValue| {
        while args.len() < 3 {
            args.push_back(LuaValue::Nil);
        }
        args[2] = LuaValue::String(lua.create_string("t")?);
        raw_load.call::<LuaMultiValue>(args)
    })?;
    globals.set("load", text_only)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: http
// ═══════════════════════════════════════════════════════════════════════

fn register_http_api(lua: &Lua, options: &HostOptions) -> LuaResult<()> {
    let client = reqwest::Client::builder()
        .timeout(options.http_timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(mlua::Error::external)?;

    let http = lua.create_table()?;

    // http.get(url, opts?) → response
    let c = client.clone();
    let opts_copy = *options;
    http.set(
        "get",
        lua.create_function(move |lua, (url, opts): (String, Option<LuaTable>)| {
            do_http_request(lua, &c, &opts_copy, "GET", &url, None, opts)
        })?,
    )?;

    // http.post(url, body, opts?) → response
    let c = client;
    let opts_copy = *options;
    http.set(
        "post",
        lua.create_function(
            move |lua, (url, body, opts): (String, String, Option<LuaTable>)| {
                do_http_request(lua, &c, &opts_copy, "POST", &url, Some(body), opts)
            },
        )?,
    )?;

    lua.globals().set("http", http)?;
    Ok(())
}

fn do_http_request(
    lua: &Lua,
    client: &reqwest::Client,
    options: &HostOptions,
    method: &str,
    url: &str,
    body: Option<String>,
    opts: Option<LuaTable>,
) -> LuaResult<LuaTable> {
    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(ref opts) = opts {
        if let Ok(table) = opts.get::<LuaTable>("headers") {
            for pair in table.pairs::<String, String>() {
                headers.push(pair?);
            }
        }
    }

    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        mlua::Error::external(anyhow::anyhow!("http.{}: no async runtime available", method.to_lowercase()))
    })?;

    let operation = format!("{} {}", method, url);
    let build = || {
        let mut builder = match method {
            "POST" => client.post(url),
            _ => client.get(url),
        };
        for (k, v) in &headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(ref body) = body {
            builder = builder.body(body.clone());
        }
        builder
    };

    let (status, ok, response_headers, text) = handle
        .block_on(async {
            let response =
                send_with_retry(&options.retry, options.http_timeout, &operation, build).await?;
            let status = response.status().as_u16();
            let ok = response.status().is_success();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let text = response.text().await.map_err(anyhow::Error::new)?;
            anyhow::Ok((status, ok, headers, text))
        })
        .map_err(|e| mlua::Error::external(anyhow::anyhow!("{:#}", e)))?;

    let headers_table = lua.create_table()?;
    for (k, v) in response_headers {
        headers_table.set(k, v)?;
    }

    let result = lua.create_table()?;
    result.set("status", status)?;
    result.set("ok", ok)?;
    result.set("headers", headers_table)?;
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
        result.set("json", json_value_to_lua(lua, &json)?)?;
    }
    result.set("body", text)?;
    Ok(result)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua, unit_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = unit_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(unit = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = unit_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(unit = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = unit_name.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            tracing::error!(unit = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = unit_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(unit = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: base64
// ═══════════════════════════════════════════════════════════════════════

fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let b64 = lua.create_table()?;

    b64.set(
        "encode",
        lua.create_function(|_lua, data: LuaString| Ok(STANDARD.encode(&data.as_bytes()[..])))?,
    )?;

    b64.set(
        "decode",
        lua.create_function(|lua, data: String| {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("base64.decode: {}", e)))?;
            lua.create_string(&bytes)
        })?,
    )?;

    lua.globals().set("base64", b64)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: crypto
// ═══════════════════════════════════════════════════════════════════════

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;

    crypto.set(
        "sha256",
        lua.create_function(|_lua, data: LuaString| {
            let mut hasher = Sha256::new();
            hasher.update(&data.as_bytes()[..]);
            Ok(hex::encode(hasher.finalize()))
        })?,
    )?;

    crypto.set(
        "hmac_sha256",
        lua.create_function(|_lua, (key, data): (LuaString, LuaString)| {
            type HmacSha256 = Hmac<Sha256>;
            let mut mac = HmacSha256::new_from_slice(&key.as_bytes()[..])
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("crypto.hmac_sha256: {}", e)))?;
            mac.update(&data.as_bytes()[..]);
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;

    lua.globals().set("crypto", crypto)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(LuaValue::Integer(i)),
            None => Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0))),
        },
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table_with_capacity(arr.len(), 0)?;
            for (i, v) in arr.iter().enumerate() {
                table.raw_set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.raw_set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to JSON. Tables with a sequence part become
/// arrays; functions and other host-only values become `null`.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair?;
                    let key = match k {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        _ => continue,
                    };
                    map.insert(key, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

/// JSON type name of a value, as used in binding errors.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
