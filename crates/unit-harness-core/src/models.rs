//! Data models for diagnostic units and the resources they run against.
//!
//! A unit travels through three shapes:
//!
//! 1. [`UnitSource`]: the raw script pushed by an external watcher.
//! 2. [`UnitMetadata`]: the declarative `unit` table reflected out of a
//!    successfully compiled source.
//! 3. [`MetadataEntity`]: the durable row in the backing store that
//!    describes a unit independent of whether it has been compiled.
//!
//! Queries are made on behalf of a [`ResourceContext`], which pairs a
//! concrete [`ResourceInstance`] with the caller's visibility.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::filter::{
    AppType, HostingEnvironmentType, PlatformType, ResourceFilter, StackType, StampType,
    SystemFilter,
};

// ═══════════════════════════════════════════════════════════════════════
// Unit sources
// ═══════════════════════════════════════════════════════════════════════

/// Whether a source is a standalone unit or a shared library fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Unit,
    Fragment,
}

impl UnitKind {
    /// Category (partition key) used for rows of this kind in the source store.
    pub fn category(&self) -> &'static str {
        match self {
            UnitKind::Unit => "unit",
            UnitKind::Fragment => "fragment",
        }
    }

    /// Kind whose rows live in `category`, compared case-insensitively.
    pub fn from_category(category: &str) -> Option<UnitKind> {
        [UnitKind::Unit, UnitKind::Fragment]
            .into_iter()
            .find(|kind| kind.category().eq_ignore_ascii_case(category))
    }
}

/// Raw text of a diagnostic unit, as submitted.
///
/// Immutable once submitted; a newer version with the same `id`
/// supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSource {
    pub id: String,
    pub kind: UnitKind,
    pub text: String,
    /// Names of shared fragments this source `require`s.
    #[serde(default)]
    pub references: Vec<String>,
}

impl UnitSource {
    pub fn unit(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: UnitKind::Unit,
            text: text.into(),
            references: Vec::new(),
        }
    }

    pub fn fragment(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: UnitKind::Fragment,
            text: text.into(),
            references: Vec::new(),
        }
    }

    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references = references.into_iter().map(Into::into).collect();
        self
    }

    /// SHA-256 of the source text, hex encoded.
    pub fn content_hash(&self) -> String {
        content_hash(&self.text)
    }
}

/// Hex-encoded SHA-256 of arbitrary text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════
// Unit metadata
// ═══════════════════════════════════════════════════════════════════════

/// The `unit.definition` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
}

/// A support-topic association. Both fields are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportTopic {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pes_id: String,
}

/// One positional parameter of a unit's entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    /// `string`, `integer`, `number`, `boolean`, `array`, `object` or `any`.
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_param_type() -> String {
    "any".to_string()
}

fn default_required() -> bool {
    true
}

/// Declarative metadata reflected out of a compiled unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub definition: Definition,
    #[serde(default)]
    pub resource_filter: Option<ResourceFilter>,
    #[serde(default)]
    pub system_filter: Option<SystemFilter>,
    #[serde(default, deserialize_with = "lua_list")]
    pub support_topics: Vec<SupportTopic>,
    #[serde(default, deserialize_with = "lua_list")]
    pub parameters: Vec<ParameterSpec>,
}

impl UnitMetadata {
    /// Metadata for a shared fragment, which declares none of its own.
    pub fn for_fragment(id: &str) -> Self {
        Self {
            definition: Definition {
                id: id.to_string(),
                name: id.to_string(),
                ..Definition::default()
            },
            ..Self::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn display_name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_system(&self) -> bool {
        self.system_filter.is_some()
    }

    /// Internal-only visibility. Units without a resource filter are
    /// never externally visible.
    pub fn internal_only(&self) -> bool {
        self.resource_filter
            .as_ref()
            .map(|f| f.internal_only)
            .unwrap_or(true)
    }
}

/// Deserialize a list that may arrive as an empty Lua table.
///
/// Lua has a single table type, so `{}` converts to an empty JSON object
/// rather than an empty array.
pub fn lua_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => serde_json::from_value(other).map_err(serde::de::Error::custom),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Resources
// ═══════════════════════════════════════════════════════════════════════

/// A web, function or API app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppResource {
    pub name: String,
    pub app_type: AppType,
    pub platform: PlatformType,
    pub stack: StackType,
    pub stamp: StampType,
}

/// An isolated hosting environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostingEnvironmentResource {
    pub name: String,
    pub platform: PlatformType,
    pub hosting_environment_type: HostingEnvironmentType,
}

/// Any resource addressed by provider and type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmResource {
    pub name: String,
    pub provider: String,
    pub resource_type: String,
}

/// A concrete resource a request is made against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceInstance {
    App(AppResource),
    HostingEnvironment(HostingEnvironmentResource),
    Arm(ArmResource),
}

impl ResourceInstance {
    pub fn name(&self) -> &str {
        match self {
            ResourceInstance::App(a) => &a.name,
            ResourceInstance::HostingEnvironment(h) => &h.name,
            ResourceInstance::Arm(r) => &r.name,
        }
    }

    /// Resource provider namespace recorded on metadata entities.
    pub fn provider(&self) -> &str {
        match self {
            ResourceInstance::App(_) | ResourceInstance::HostingEnvironment(_) => "Microsoft.Web",
            ResourceInstance::Arm(r) => &r.provider,
        }
    }

    /// Resource type name recorded on metadata entities.
    pub fn resource_type_name(&self) -> &str {
        match self {
            ResourceInstance::App(_) => "sites",
            ResourceInstance::HostingEnvironment(_) => "hostingEnvironments",
            ResourceInstance::Arm(r) => &r.resource_type,
        }
    }
}

/// A resource plus the caller's visibility, passed to every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContext {
    pub resource: ResourceInstance,
    #[serde(default)]
    pub client_is_internal: bool,
}

impl ResourceContext {
    pub fn new(resource: ResourceInstance, client_is_internal: bool) -> Self {
        Self {
            resource,
            client_is_internal,
        }
    }

    pub fn internal(resource: ResourceInstance) -> Self {
        Self::new(resource, true)
    }

    pub fn external(resource: ResourceInstance) -> Self {
        Self::new(resource, false)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Metadata entities
// ═══════════════════════════════════════════════════════════════════════

/// A unit's source-of-truth row in the backing store.
///
/// `partition_key` is the category (`unit`, `fragment`); `row_key` is the
/// unit identifier and is unique within its partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntity {
    pub partition_key: String,
    pub row_key: String,
    /// Display name, used for ordering.
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    /// Display grouping from the unit definition.
    #[serde(default)]
    pub group: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub is_internal: bool,
    #[serde(default)]
    pub resource_provider: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Fragment identifiers the unit references.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub support_topics: Vec<SupportTopic>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl MetadataEntity {
    pub fn new(
        category: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_key: category.into(),
            row_key: id.into(),
            name: name.into(),
            author: String::new(),
            description: String::new(),
            group: String::new(),
            last_modified,
            is_disabled: false,
            is_internal: false,
            resource_provider: None,
            resource_type: None,
            dependencies: Vec::new(),
            support_topics: Vec::new(),
            content_hash: None,
        }
    }

    /// Build the store row describing a compiled unit.
    pub fn from_metadata(
        source: &UnitSource,
        metadata: &UnitMetadata,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let mut entity = Self::new(
            source.kind.category(),
            source.id.clone(),
            if metadata.display_name().is_empty() {
                source.id.clone()
            } else {
                metadata.display_name().to_string()
            },
            last_modified,
        );
        entity.author = metadata.definition.author.clone();
        entity.description = metadata.definition.description.clone();
        entity.group = metadata.definition.category.clone();
        entity.is_internal = metadata.internal_only();
        entity.dependencies = source.references.clone();
        entity.support_topics = metadata.support_topics.clone();
        entity.content_hash = Some(source.content_hash());
        if let Some(filter) = &metadata.resource_filter {
            let (provider, resource_type) = filter.provider_and_type();
            entity.resource_provider = Some(provider);
            entity.resource_type = Some(resource_type);
        }
        entity
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.is_disabled = disabled;
        self
    }

    pub fn with_resource(
        mut self,
        provider: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        self.resource_provider = Some(provider.into());
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Whether two rows describe the same unit (row keys compare case-insensitively).
    pub fn same_row(&self, other: &MetadataEntity) -> bool {
        self.row_key.eq_ignore_ascii_case(&other.row_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_from_lua_shaped_json() {
        let value = json!({
            "definition": { "id": "cpu", "name": "High CPU", "author": "ops" },
            "support_topics": {},
            "parameters": [ { "name": "resource", "type": "object" } ],
            "run": null,
        });
        let meta: UnitMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(meta.id(), "cpu");
        assert!(meta.support_topics.is_empty());
        assert_eq!(meta.parameters.len(), 1);
        assert!(meta.parameters[0].required);
        assert!(meta.internal_only());
    }

    #[test]
    fn test_metadata_requires_definition() {
        let value = json!({ "parameters": [] });
        assert!(serde_json::from_value::<UnitMetadata>(value).is_err());
    }

    #[test]
    fn test_parameter_defaults() {
        let p: ParameterSpec = serde_json::from_value(json!({ "name": "x" })).unwrap();
        assert_eq!(p.param_type, "any");
        assert!(p.required);
    }

    #[test]
    fn test_resource_provider_and_type() {
        let arm = ResourceInstance::Arm(ArmResource {
            name: "kv".into(),
            provider: "Microsoft.KeyVault".into(),
            resource_type: "vaults".into(),
        });
        assert_eq!(arm.provider(), "Microsoft.KeyVault");
        assert_eq!(arm.resource_type_name(), "vaults");
    }

    #[test]
    fn test_same_row_ignores_case() {
        let a = MetadataEntity::new("unit", "CpuCheck", "a", Utc::now());
        let b = MetadataEntity::new("unit", "cpucheck", "b", Utc::now());
        assert!(a.same_row(&b));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let s = UnitSource::unit("a", "return 1");
        assert_eq!(s.content_hash(), content_hash("return 1"));
        assert_eq!(s.content_hash().len(), 64);
    }

    #[test]
    fn test_kind_from_category() {
        assert_eq!(UnitKind::from_category("Fragment"), Some(UnitKind::Fragment));
        assert_eq!(UnitKind::from_category("unit"), Some(UnitKind::Unit));
        assert_eq!(UnitKind::from_category("detector"), None);
    }
}
