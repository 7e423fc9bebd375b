use serde::{Deserialize, Serialize};

/// Item type discriminator — a plain string like `"profile"` or `"session"`.
pub type ItemType = String;

/// Tenant identifier. Every document and query is scoped to exactly one
/// tenant; [`TenantId::SYSTEM`] denotes unscoped platform data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub const SYSTEM: &'static str = "system";

    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    pub fn system() -> Self {
        TenantId(Self::SYSTEM.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

/// Transient storage metadata attached to an item at read/write time.
///
/// The sequence number and primary term are the backend's optimistic
/// concurrency tokens; a subsequent conditional write replays them so a
/// concurrent modification is detected as a version conflict. The physical
/// index lets later writes target the exact index a rolling-type document
/// lives in instead of the write alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMeta {
    pub seq_no: Option<u64>,
    pub primary_term: Option<u64>,
    pub index: Option<String>,
    pub tenant_id: Option<TenantId>,
}

impl ItemMeta {
    pub fn has_concurrency_tokens(&self) -> bool {
        self.seq_no.is_some() && self.primary_term.is_some()
    }
}

/// A stored item: logical identity plus its JSON source document.
///
/// `meta` is never persisted — it is populated by the codec from backend
/// responses and consumed by later conditional writes.
#[derive(Debug, Clone)]
pub struct Item {
    pub item_id: String,
    pub item_type: ItemType,
    pub tenant_id: TenantId,
    pub source: serde_json::Value,
    pub meta: ItemMeta,
}

impl Item {
    pub fn new(
        item_id: impl Into<String>,
        item_type: impl Into<String>,
        tenant_id: TenantId,
        source: serde_json::Value,
    ) -> Self {
        Item {
            item_id: item_id.into(),
            item_type: item_type.into(),
            tenant_id,
            source,
            meta: ItemMeta::default(),
        }
    }
}
