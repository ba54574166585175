//! # Unit Harness Core
//!
//! Runtime-free logic shared by every Unit Harness host: the unit data
//! model, bitmask resource filters and the applicability matcher, the
//! generic keyed cache with its bounded and lookup specialisations, the
//! incremental merge used by the metadata poller, and the collaborator
//! store traits with in-memory implementations.
//!
//! This crate contains no tokio, sqlx, Lua, or filesystem I/O. Anything
//! that compiles or executes a unit lives in the `unit-harness` crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Unit sources, metadata, resources, metadata entities |
//! | [`filter`] | Bitmask flag types, resource/system filters, matching |
//! | [`cache`] | [`cache::Cache`] trait, [`cache::KeyedCache`], bounded FIFO cache, lookup caches |
//! | [`merge`] | Replace-or-merge of metadata entity snapshots |
//! | [`store`] | `SourceStore`, `BlobStore`, `UnitSourceResolver` traits |

pub mod cache;
pub mod filter;
pub mod merge;
pub mod models;
pub mod store;
