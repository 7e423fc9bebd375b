//! Type-to-index routing and the rolling write-index cache.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

/// Platform types collapsed into the shared `systemitems` index.
static SYSTEM_ITEM_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "actionType",
        "campaign",
        "campaignevent",
        "goal",
        "userList",
        "propertyType",
        "scope",
        "conditionType",
        "rule",
        "scoring",
        "segment",
        "groovyAction",
        "topic",
        "patch",
        "jsonSchema",
        "importConfig",
        "exportConfig",
        "rulestats",
    ]
    .into_iter()
    .collect()
});

/// How a type's documents are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// One index of its own, named after the type.
    Dedicated,
    /// Shares a physical index with other types.
    Shared,
    /// Rolling numbered indices behind a write alias.
    Rolling,
}

/// Per-deployment type layout: which types share an index, which roll over,
/// and the name collapses between them.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    shared_names: HashMap<String, String>,
    rolling: HashSet<String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let mut shared_names: HashMap<String, String> = SYSTEM_ITEM_TYPES
            .iter()
            .map(|t| (t.to_string(), "systemitems".to_string()))
            .collect();
        // personas are profiles for storage purposes
        shared_names.insert("profile".into(), "profile".into());
        shared_names.insert("persona".into(), "profile".into());

        TypeRegistry {
            shared_names,
            rolling: ["event", "session"].into_iter().map(String::from).collect(),
        }
    }
}

impl TypeRegistry {
    /// Empty registry: every type gets a dedicated index.
    pub fn dedicated_only() -> Self {
        TypeRegistry {
            shared_names: HashMap::new(),
            rolling: HashSet::new(),
        }
    }

    pub fn with_rolling(mut self, item_type: impl Into<String>) -> Self {
        self.rolling.insert(item_type.into());
        self
    }

    /// Replaces the rolling set wholesale, typically from configuration.
    pub fn with_rolling_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rolling = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shared(
        mut self,
        item_type: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Self {
        self.shared_names.insert(item_type.into(), index_name.into());
        self
    }

    pub fn placement(&self, item_type: &str) -> Placement {
        if self.rolling.contains(item_type) {
            Placement::Rolling
        } else if self.shared_names.contains_key(item_type) {
            Placement::Shared
        } else {
            Placement::Dedicated
        }
    }

    /// The index-name component for a type, after shared-index collapsing.
    fn name_component(&self, item_type: &str) -> String {
        self.shared_names
            .get(item_type)
            .cloned()
            .unwrap_or_else(|| item_type.to_string())
    }

    pub fn rolling_types(&self) -> impl Iterator<Item = &str> {
        self.rolling.iter().map(String::as_str)
    }
}

/// Maps item types to index names and tracks, per rolling type, the physical
/// index writes currently land in so point reads can skip the wildcard
/// fan-out.
pub struct IndexRouter {
    prefix: String,
    registry: TypeRegistry,
    latest_write_index: DashMap<String, String>,
}

impl IndexRouter {
    pub fn new(prefix: impl Into<String>, registry: TypeRegistry) -> Self {
        IndexRouter {
            prefix: prefix.into(),
            registry,
            latest_write_index: DashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn placement(&self, item_type: &str) -> Placement {
        self.registry.placement(item_type)
    }

    /// Base name for a type: also the write alias of rolling types. Index
    /// names are lowercase end to end, whatever case the prefix or an
    /// override carries.
    pub fn base_name(&self, item_type: &str) -> String {
        format!("{}-{}", self.prefix, self.registry.name_component(item_type)).to_lowercase()
    }

    /// Name writes are addressed to. Rolling types write through their alias.
    pub fn write_index(&self, item_type: &str) -> String {
        self.base_name(item_type)
    }

    /// Pattern reads are addressed to. Rolling types fan out over every
    /// generation.
    pub fn read_index(&self, item_type: &str) -> String {
        match self.placement(item_type) {
            Placement::Rolling => format!("{}-*", self.base_name(item_type)),
            _ => self.base_name(item_type),
        }
    }

    /// Pattern covering every index this deployment owns.
    pub fn all_indices(&self) -> String {
        format!("{}*", self.prefix).to_lowercase()
    }

    /// First physical generation of a rolling type.
    pub fn first_generation(&self, item_type: &str) -> String {
        format!("{}-000001", self.base_name(item_type))
    }

    /// Queries against shared indices must also constrain the item type.
    pub fn item_type_constraint<'a>(&self, item_type: &'a str) -> Option<&'a str> {
        match self.placement(item_type) {
            Placement::Shared => Some(item_type),
            _ => None,
        }
    }

    /// Last physical index a write for this rolling type landed in.
    pub fn latest_write_index(&self, item_type: &str) -> Option<String> {
        self.latest_write_index
            .get(item_type)
            .map(|entry| entry.clone())
    }

    /// Records the physical index a write response reported. Only useful for
    /// rolling types; cheap to call unconditionally.
    pub fn record_write_index(&self, item_type: &str, physical_index: &str) {
        if self.placement(item_type) != Placement::Rolling {
            return;
        }
        let stale = self
            .latest_write_index(item_type)
            .map(|current| current != physical_index)
            .unwrap_or(true);
        if stale {
            tracing::info!(
                item_type,
                physical_index,
                "rolled over to new write index"
            );
            self.latest_write_index
                .insert(item_type.to_string(), physical_index.to_string());
        }
    }
}
