//! # Unit Harness
//!
//! Hosts dynamically compiled diagnostic units: small Lua programs that
//! declare which resources they apply to and expose one entry point.
//!
//! The harness compiles each unit once, caches the result, answers "which
//! units apply to this resource?", invokes a chosen unit against a
//! resource, and keeps a poll-refreshed in-memory copy of the durable
//! metadata rows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ SourceStore │──▶│ Metadata     │──▶│ warm / list  │
//! │ SQLite/mem  │   │ entity cache │   │              │
//! └─────────────┘   └──────────────┘   │ Orchestrator │──▶ invoke
//! ┌─────────────┐   ┌──────────────┐   │              │
//! │ Resolver /  │──▶│ Lua compiler │──▶│ index + LRU  │
//! │ BlobStore   │   │              │   └──────────────┘
//! └─────────────┘   └──────────────┘
//! ```
//!
//! Pure types, bitmask filters and cache primitives live in the
//! `unit-harness-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors of the public surface |
//! | [`retry`] | Bounded retry with deadline for external calls |
//! | [`lua_runtime`] | Sandboxed Lua VM and host APIs |
//! | [`compiler`] | Lua unit compiler, artifacts and invocation |
//! | [`unit`] | Compiled unit state and diagnostics |
//! | [`unit_index`] | Resource, system and fragment views of compiled units |
//! | [`entity_cache`] | Poll-refreshed metadata rows by category |
//! | [`orchestrator`] | Publish, list, get and invoke |
//! | [`host`] | Wiring from config and the background poller |
//! | [`sqlite_store`] | SQLite `SourceStore` |
//! | [`blob_store`] | Filesystem `BlobStore` |
//! | [`source_fs`] | Filesystem `UnitSourceResolver` |
//! | [`unit_cmd`] | CLI subcommands |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod blob_store;
pub mod compiler;
pub mod config;
pub mod db;
pub mod entity_cache;
pub mod error;
pub mod host;
pub mod lua_runtime;
pub mod migrate;
pub mod orchestrator;
pub mod retry;
pub mod source_fs;
pub mod sqlite_store;
pub mod unit;
pub mod unit_cmd;
pub mod unit_index;
