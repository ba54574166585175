//! Index of compiled units, partitioned by kind and keyed by lower-cased
//! identifier.
//!
//! Units and fragments live in separate partitions, so a unit and a
//! fragment may share an id. Failed compilations are indexed too, so a
//! unit's diagnostics stay queryable by id, but the read views below only
//! ever return ready units.
//!
//! | View | Contents | Visible to |
//! |------|----------|------------|
//! | [`UnitIndex::resource_units`] | units with a resource filter matching the resource | external clients see only non-internal units |
//! | [`UnitIndex::system_units`] | units with a system filter | internal clients only |
//! | [`UnitIndex::fragments`] | shared fragments | everyone |
//!
//! Listings are ordered by display name; equal names keep the order in
//! which their units were first indexed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use unit_harness_core::cache::{Cache, KeyedCache};
use unit_harness_core::filter::is_applicable;
use unit_harness_core::models::{ResourceContext, UnitKind};

use crate::unit::CompiledUnit;

#[derive(Clone)]
struct IndexEntry {
    /// Order of first insertion, kept across updates.
    seq: u64,
    unit: Arc<CompiledUnit>,
}

pub struct UnitIndex {
    units: KeyedCache<String, IndexEntry>,
    fragments: KeyedCache<String, IndexEntry>,
    next_seq: AtomicU64,
}

impl UnitIndex {
    pub fn new() -> Self {
        Self {
            units: KeyedCache::case_insensitive(),
            fragments: KeyedCache::case_insensitive(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn partition(&self, kind: UnitKind) -> &KeyedCache<String, IndexEntry> {
        match kind {
            UnitKind::Unit => &self.units,
            UnitKind::Fragment => &self.fragments,
        }
    }

    /// Index `unit` in its kind's partition, replacing any entry with the
    /// same id there.
    pub fn insert(&self, unit: Arc<CompiledUnit>) {
        let partition = self.partition(unit.kind);
        let key = unit.id.clone();
        let seq = partition
            .try_get(&key)
            .map(|e| e.seq)
            .unwrap_or_else(|| self.next_seq.fetch_add(1, Ordering::Relaxed));
        partition.add_or_update(key, IndexEntry { seq, unit });
    }

    pub fn get(&self, kind: UnitKind, id: &str) -> Option<Arc<CompiledUnit>> {
        self.partition(kind).try_get(&id.to_string()).map(|e| e.unit)
    }

    pub fn remove(&self, kind: UnitKind, id: &str) -> Option<Arc<CompiledUnit>> {
        self.partition(kind).try_remove(&id.to_string()).map(|e| e.unit)
    }

    pub fn len(&self) -> usize {
        self.units.len() + self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sorted(&self, mut entries: Vec<IndexEntry>) -> Vec<Arc<CompiledUnit>> {
        entries.sort_by_cached_key(|e| (e.unit.display_name().to_lowercase(), e.seq));
        entries.into_iter().map(|e| e.unit).collect()
    }

    fn ready(partition: &KeyedCache<String, IndexEntry>) -> impl Iterator<Item = IndexEntry> {
        partition
            .get_all()
            .into_iter()
            .filter(|e| e.unit.is_compilation_successful())
    }

    /// Ready units whose resource filter matches `ctx`.
    pub fn resource_units(&self, ctx: &ResourceContext) -> Vec<Arc<CompiledUnit>> {
        let matching = Self::ready(&self.units)
            .filter(|e| is_resource_unit_for(&e.unit, ctx))
            .collect();
        self.sorted(matching)
    }

    pub fn resource_unit(&self, id: &str, ctx: &ResourceContext) -> Option<Arc<CompiledUnit>> {
        self.get(UnitKind::Unit, id)
            .filter(|u| u.is_compilation_successful() && is_resource_unit_for(u, ctx))
    }

    /// Ready system units. Empty for external clients.
    pub fn system_units(&self, ctx: &ResourceContext) -> Vec<Arc<CompiledUnit>> {
        if !ctx.client_is_internal {
            return Vec::new();
        }
        let system = Self::ready(&self.units).filter(|e| is_system_unit(&e.unit)).collect();
        self.sorted(system)
    }

    pub fn system_unit(&self, id: &str, ctx: &ResourceContext) -> Option<Arc<CompiledUnit>> {
        if !ctx.client_is_internal {
            return None;
        }
        self.get(UnitKind::Unit, id)
            .filter(|u| u.is_compilation_successful() && is_system_unit(u))
    }

    /// Ready shared fragments.
    pub fn fragments(&self) -> Vec<Arc<CompiledUnit>> {
        let fragments = Self::ready(&self.fragments).collect();
        self.sorted(fragments)
    }

    /// Units and fragments that failed to compile.
    pub fn failed(&self) -> Vec<Arc<CompiledUnit>> {
        let failed = self
            .units
            .get_all()
            .into_iter()
            .chain(self.fragments.get_all())
            .filter(|e| !e.unit.is_compilation_successful())
            .collect();
        self.sorted(failed)
    }
}

impl Default for UnitIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `ctx` may see `unit` when asking for it by id. Failed units
/// stay visible so their diagnostics can be read.
pub(crate) fn is_visible(unit: &CompiledUnit, ctx: &ResourceContext) -> bool {
    !unit.is_compilation_successful()
        || unit.kind == UnitKind::Fragment
        || is_resource_unit_for(unit, ctx)
        || (ctx.client_is_internal && is_system_unit(unit))
}

fn is_resource_unit_for(unit: &CompiledUnit, ctx: &ResourceContext) -> bool {
    if unit.kind != UnitKind::Unit {
        return false;
    }
    let Some(metadata) = &unit.metadata else {
        return false;
    };
    match (&metadata.resource_filter, &metadata.system_filter) {
        (Some(filter), None) => {
            (ctx.client_is_internal || !filter.internal_only) && is_applicable(&ctx.resource, filter)
        }
        _ => false,
    }
}

fn is_system_unit(unit: &CompiledUnit) -> bool {
    unit.kind == UnitKind::Unit
        && unit
            .metadata
            .as_ref()
            .map(|m| m.is_system() && m.resource_filter.is_none())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileErrorKind;
    use crate::unit::UnitArtifact;
    use unit_harness_core::filter::{
        AppType, PlatformType, ResourceFilter, StackType, StampType, SystemFilter,
    };
    use unit_harness_core::models::{AppResource, Definition, ResourceInstance, UnitMetadata};

    fn artifact() -> UnitArtifact {
        UnitArtifact {
            module: Vec::new(),
            debug: Vec::new(),
        }
    }

    fn metadata(id: &str, name: &str) -> UnitMetadata {
        UnitMetadata {
            definition: Definition {
                id: id.into(),
                name: name.into(),
                author: "ops".into(),
                ..Definition::default()
            },
            ..UnitMetadata::default()
        }
    }

    fn resource_unit(id: &str, name: &str, filter: ResourceFilter) -> Arc<CompiledUnit> {
        let mut meta = metadata(id, name);
        meta.resource_filter = Some(filter);
        Arc::new(CompiledUnit::ready(id, UnitKind::Unit, meta, artifact(), vec![]))
    }

    fn system_unit(id: &str) -> Arc<CompiledUnit> {
        let mut meta = metadata(id, id);
        meta.system_filter = Some(SystemFilter::default());
        Arc::new(CompiledUnit::ready(id, UnitKind::Unit, meta, artifact(), vec![]))
    }

    fn linux_app(internal: bool) -> ResourceContext {
        ResourceContext::new(
            ResourceInstance::App(AppResource {
                name: "site".into(),
                app_type: AppType::WEB_APP,
                platform: PlatformType::LINUX,
                stack: StackType::NODE,
                stamp: StampType::PUBLIC,
            }),
            internal,
        )
    }

    #[test]
    fn test_resource_units_sorted_by_name_then_insertion() {
        let index = UnitIndex::new();
        index.insert(resource_unit("b", "Beta", ResourceFilter::app()));
        index.insert(resource_unit("a2", "alpha", ResourceFilter::app()));
        index.insert(resource_unit("a1", "Alpha", ResourceFilter::app()));
        index.insert(resource_unit(
            "win",
            "Windows only",
            ResourceFilter::app().with_platform(PlatformType::WINDOWS),
        ));

        let ids: Vec<String> = index
            .resource_units(&linux_app(false))
            .iter()
            .map(|u| u.id.clone())
            .collect();
        assert_eq!(ids, vec!["a2", "a1", "b"]);
    }

    #[test]
    fn test_update_keeps_original_position() {
        let index = UnitIndex::new();
        index.insert(resource_unit("x", "Same", ResourceFilter::app()));
        index.insert(resource_unit("y", "Same", ResourceFilter::app()));
        index.insert(resource_unit("X", "Same", ResourceFilter::app()));

        let ids: Vec<String> = index
            .resource_units(&linux_app(false))
            .iter()
            .map(|u| u.id.clone())
            .collect();
        assert_eq!(ids, vec!["X", "y"]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_internal_units_hidden_from_external_clients() {
        let index = UnitIndex::new();
        index.insert(resource_unit("secret", "Secret", ResourceFilter::app().internal_only(true)));
        assert!(index.resource_units(&linux_app(false)).is_empty());
        assert_eq!(index.resource_units(&linux_app(true)).len(), 1);
        assert!(index.resource_unit("SECRET", &linux_app(false)).is_none());
        assert!(index.resource_unit("SECRET", &linux_app(true)).is_some());
    }

    #[test]
    fn test_system_and_resource_views_are_disjoint() {
        let index = UnitIndex::new();
        index.insert(system_unit("sys"));
        index.insert(resource_unit("res", "Res", ResourceFilter::app()));

        let internal = linux_app(true);
        let resource_ids: Vec<_> = index.resource_units(&internal).iter().map(|u| u.id.clone()).collect();
        let system_ids: Vec<_> = index.system_units(&internal).iter().map(|u| u.id.clone()).collect();
        assert_eq!(resource_ids, vec!["res"]);
        assert_eq!(system_ids, vec!["sys"]);

        assert!(index.system_units(&linux_app(false)).is_empty());
        assert!(index.system_unit("sys", &linux_app(false)).is_none());
        assert!(index.system_unit("sys", &internal).is_some());
    }

    #[test]
    fn test_failed_units_excluded_from_views() {
        let index = UnitIndex::new();
        index.insert(Arc::new(CompiledUnit::failed(
            "broken",
            UnitKind::Unit,
            CompileErrorKind::InvalidMetadata,
            vec![],
        )));
        assert!(index.resource_units(&linux_app(true)).is_empty());
        assert!(index.get(UnitKind::Unit, "BROKEN").is_some());
        assert_eq!(index.failed().len(), 1);
    }

    #[test]
    fn test_remove() {
        let index = UnitIndex::new();
        index.insert(system_unit("sys"));
        assert!(index.remove(UnitKind::Fragment, "sys").is_none());
        assert!(index.remove(UnitKind::Unit, "SYS").is_some());
        assert!(index.is_empty());
    }

    #[test]
    fn test_unit_and_fragment_share_an_id() {
        let index = UnitIndex::new();
        index.insert(resource_unit("cpu", "High CPU", ResourceFilter::app()));
        index.insert(Arc::new(CompiledUnit::ready(
            "CPU",
            UnitKind::Fragment,
            UnitMetadata::for_fragment("CPU"),
            artifact(),
            vec![],
        )));

        assert_eq!(index.len(), 2);
        assert_eq!(index.resource_units(&linux_app(false)).len(), 1);
        assert_eq!(index.fragments().len(), 1);
        assert_eq!(index.get(UnitKind::Unit, "cpu").unwrap().kind, UnitKind::Unit);
        assert_eq!(index.get(UnitKind::Fragment, "cpu").unwrap().kind, UnitKind::Fragment);
    }
}
