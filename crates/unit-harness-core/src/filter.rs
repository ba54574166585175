//! Bitmask resource filters and the applicability matcher.
//!
//! Every filter field is a capability set. A resource matches a field
//! when the two masks share at least one bit (`(filter & resource) > 0`),
//! never by equality, so authors can combine flags freely:
//!
//! ```lua
//! resource_filter = {
//!     kind = "app",
//!     app_type = { "web_app", "function_app" },
//!     platform = "windows",
//!     stack = "all",
//!     internal_only = false,
//! }
//! ```
//!
//! Flags deserialize from an integer mask, a flag name (`"web_app"`), a
//! `|`/`,` separated list of names, or an array of names.
//!
//! Two deliberate exceptions to the plain bit test:
//!
//! - a resource whose stack is [`StackType::NONE`] satisfies any stack
//!   requirement;
//! - metadata entities are matched on provider and type name strings,
//!   case-insensitively, instead of bitmasks.

use std::fmt;
use std::marker::PhantomData;

use bitflags::{bitflags, Flags};
use serde::de::{self, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{MetadataEntity, ResourceInstance};

// ═══════════════════════════════════════════════════════════════════════
// Flag types
// ═══════════════════════════════════════════════════════════════════════

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AppType: u32 {
        const WEB_APP = 1;
        const FUNCTION_APP = 1 << 1;
        const API_APP = 1 << 2;
        const ALL = 255;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlatformType: u32 {
        const WINDOWS = 1;
        const LINUX = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StackType: u32 {
        const NONE = 0;
        const ASP_NET = 1;
        const NET_CORE = 1 << 1;
        const PHP = 1 << 2;
        const NODE = 1 << 3;
        const JAVA = 1 << 4;
        const ALL = 255;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StampType: u32 {
        const PUBLIC = 1;
        const ASE_V1 = 1 << 1;
        const ASE_V2 = 1 << 2;
        const ALL = 255;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostingEnvironmentType: u32 {
        const NONE = 0;
        const V1 = 1;
        const V2 = 1 << 1;
        const ALL = 255;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceType: u32 {
        const APP = 1;
        const HOSTING_ENVIRONMENT = 1 << 1;
        const ARM_RESOURCE = 1 << 2;
    }
}

/// Parse a flag expression such as `"web_app"`, `"windows|linux"` or
/// `"ase-v1, ase-v2"`. Names are matched case-insensitively; `-` and
/// spaces are read as `_`.
pub fn parse_flags<F: Flags>(expr: &str) -> Option<F> {
    let mut acc = F::empty();
    for part in expr.split(['|', ',']) {
        let name = part.trim().replace(['-', ' '], "_").to_ascii_uppercase();
        if name.is_empty() {
            continue;
        }
        acc = acc.union(F::from_name(&name)?);
    }
    Some(acc)
}

struct FlagVisitor<F> {
    label: &'static str,
    _marker: PhantomData<F>,
}

impl<'de, F: Flags<Bits = u32>> Visitor<'de> for FlagVisitor<F> {
    type Value = F;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} as an integer mask, a flag name, or a list of flag names",
            self.label
        )
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<F, E> {
        u32::try_from(v)
            .map(F::from_bits_retain)
            .map_err(|_| E::custom(format!("{} mask out of range: {}", self.label, v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<F, E> {
        u32::try_from(v)
            .map(F::from_bits_retain)
            .map_err(|_| E::custom(format!("{} mask out of range: {}", self.label, v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<F, E> {
        parse_flags(v).ok_or_else(|| E::custom(format!("unknown {} flag '{}'", self.label, v)))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<F, A::Error> {
        let mut acc = F::empty();
        while let Some(name) = seq.next_element::<String>()? {
            let flag = parse_flags::<F>(&name).ok_or_else(|| {
                <A::Error as de::Error>::custom(format!("unknown {} flag '{}'", self.label, name))
            })?;
            acc = acc.union(flag);
        }
        Ok(acc)
    }

    // An empty Lua table arrives as an empty map.
    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<F, A::Error> {
        if map.next_key::<IgnoredAny>()?.is_some() {
            return Err(<A::Error as de::Error>::custom(format!(
                "{} must be a mask, a name, or a list of names",
                self.label
            )));
        }
        Ok(F::empty())
    }
}

macro_rules! flag_serde {
    ($ty:ident, $label:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(FlagVisitor::<$ty> {
                    label: $label,
                    _marker: PhantomData,
                })
            }
        }
    };
}

flag_serde!(AppType, "app_type");
flag_serde!(PlatformType, "platform");
flag_serde!(StackType, "stack");
flag_serde!(StampType, "stamp");
flag_serde!(HostingEnvironmentType, "hosting_environment_type");
flag_serde!(ResourceType, "resource_type");

// ═══════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════

/// The resource shape a filter targets, with its per-shape criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterShape {
    App {
        #[serde(default = "default_app_type")]
        app_type: AppType,
        #[serde(default = "default_platform")]
        platform: PlatformType,
        #[serde(default = "default_stack")]
        stack: StackType,
        #[serde(default = "default_stamp")]
        stamp: StampType,
    },
    HostingEnvironment {
        #[serde(default = "default_platform")]
        platform: PlatformType,
        #[serde(default = "default_hosting_environment_type")]
        hosting_environment_type: HostingEnvironmentType,
    },
    Arm {
        #[serde(default)]
        provider: String,
        #[serde(default)]
        resource_type: String,
    },
}

fn default_app_type() -> AppType {
    AppType::ALL
}
fn default_platform() -> PlatformType {
    PlatformType::WINDOWS | PlatformType::LINUX
}
fn default_stack() -> StackType {
    StackType::ALL
}
fn default_stamp() -> StampType {
    StampType::ALL
}
fn default_hosting_environment_type() -> HostingEnvironmentType {
    HostingEnvironmentType::ALL
}
fn default_internal_only() -> bool {
    true
}

/// Declares which resources a unit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    #[serde(flatten)]
    pub shape: FilterShape,
    /// Hide the unit from external clients.
    #[serde(default = "default_internal_only")]
    pub internal_only: bool,
}

impl ResourceFilter {
    /// An app filter with every field at its default (all apps, both
    /// platforms, all stacks and stamps), visible to external clients.
    pub fn app() -> Self {
        Self {
            shape: FilterShape::App {
                app_type: default_app_type(),
                platform: default_platform(),
                stack: default_stack(),
                stamp: default_stamp(),
            },
            internal_only: false,
        }
    }

    pub fn hosting_environment() -> Self {
        Self {
            shape: FilterShape::HostingEnvironment {
                platform: default_platform(),
                hosting_environment_type: default_hosting_environment_type(),
            },
            internal_only: false,
        }
    }

    pub fn arm(provider: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            shape: FilterShape::Arm {
                provider: provider.into(),
                resource_type: resource_type.into(),
            },
            internal_only: false,
        }
    }

    pub fn internal_only(mut self, internal_only: bool) -> Self {
        self.internal_only = internal_only;
        self
    }

    /// Replace the platform mask on app and hosting-environment filters.
    pub fn with_platform(mut self, mask: PlatformType) -> Self {
        match &mut self.shape {
            FilterShape::App { platform, .. } | FilterShape::HostingEnvironment { platform, .. } => {
                *platform = mask
            }
            FilterShape::Arm { .. } => {}
        }
        self
    }

    pub fn with_stack(mut self, mask: StackType) -> Self {
        if let FilterShape::App { stack, .. } = &mut self.shape {
            *stack = mask;
        }
        self
    }

    pub fn with_app_type(mut self, mask: AppType) -> Self {
        if let FilterShape::App { app_type, .. } = &mut self.shape {
            *app_type = mask;
        }
        self
    }

    /// The resource-type bit this filter targets.
    pub fn resource_type(&self) -> ResourceType {
        match self.shape {
            FilterShape::App { .. } => ResourceType::APP,
            FilterShape::HostingEnvironment { .. } => ResourceType::HOSTING_ENVIRONMENT,
            FilterShape::Arm { .. } => ResourceType::ARM_RESOURCE,
        }
    }

    /// Provider and type name recorded on the unit's metadata entity.
    pub fn provider_and_type(&self) -> (String, String) {
        match &self.shape {
            FilterShape::App { .. } => ("Microsoft.Web".to_string(), "sites".to_string()),
            FilterShape::HostingEnvironment { .. } => (
                "Microsoft.Web".to_string(),
                "hostingEnvironments".to_string(),
            ),
            FilterShape::Arm {
                provider,
                resource_type,
            } => (provider.clone(), resource_type.clone()),
        }
    }

    /// Names of criteria that can never match: zero bitmasks and blank
    /// provider/type strings.
    pub fn empty_criteria(&self) -> Vec<&'static str> {
        let mut empty = Vec::new();
        match &self.shape {
            FilterShape::App {
                app_type,
                platform,
                stack,
                stamp,
            } => {
                if app_type.is_empty() {
                    empty.push("app_type");
                }
                if platform.is_empty() {
                    empty.push("platform");
                }
                if stack.is_empty() {
                    empty.push("stack");
                }
                if stamp.is_empty() {
                    empty.push("stamp");
                }
            }
            FilterShape::HostingEnvironment {
                platform,
                hosting_environment_type,
            } => {
                if platform.is_empty() {
                    empty.push("platform");
                }
                if hosting_environment_type.is_empty() {
                    empty.push("hosting_environment_type");
                }
            }
            FilterShape::Arm {
                provider,
                resource_type,
            } => {
                if provider.trim().is_empty() {
                    empty.push("provider");
                }
                if resource_type.trim().is_empty() {
                    empty.push("resource_type");
                }
            }
        }
        empty
    }
}

/// Marks a system unit. Carries no criteria of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFilter {}

// ═══════════════════════════════════════════════════════════════════════
// Matching
// ═══════════════════════════════════════════════════════════════════════

/// Whether `resource` satisfies every criterion of `filter`.
///
/// A filter for a different resource shape never matches.
pub fn is_applicable(resource: &ResourceInstance, filter: &ResourceFilter) -> bool {
    match (&filter.shape, resource) {
        (
            FilterShape::App {
                app_type,
                platform,
                stack,
                stamp,
            },
            ResourceInstance::App(app),
        ) => {
            app_type.intersects(app.app_type)
                && platform.intersects(app.platform)
                && stack_matches(*stack, app.stack)
                && stamp.intersects(app.stamp)
        }
        (
            FilterShape::HostingEnvironment {
                platform,
                hosting_environment_type,
            },
            ResourceInstance::HostingEnvironment(env),
        ) => {
            platform.intersects(env.platform)
                && hosting_environment_type.intersects(env.hosting_environment_type)
        }
        (
            FilterShape::Arm {
                provider,
                resource_type,
            },
            ResourceInstance::Arm(arm),
        ) => {
            provider.eq_ignore_ascii_case(&arm.provider)
                && resource_type.eq_ignore_ascii_case(&arm.resource_type)
        }
        _ => false,
    }
}

fn stack_matches(filter: StackType, resource: StackType) -> bool {
    resource.is_empty() || filter.intersects(resource)
}

/// Whether a metadata entity applies to `resource`, by provider and type
/// name. Entities without both strings never match.
pub fn entity_is_applicable(resource: &ResourceInstance, entity: &MetadataEntity) -> bool {
    match (&entity.resource_provider, &entity.resource_type) {
        (Some(provider), Some(resource_type)) => {
            provider.eq_ignore_ascii_case(resource.provider())
                && resource_type.eq_ignore_ascii_case(resource.resource_type_name())
        }
        _ => false,
    }
}
