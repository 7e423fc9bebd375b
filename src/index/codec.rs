//! Document id scheme and item/source conversion.
//!
//! Physical document ids carry the tenant as a prefix so one index can hold
//! many tenants, and a lowercased type suffix when the type shares its index
//! with others. Decoding inverts both; documents written before the suffix
//! scheme keep a plain `itemId` field in their source, which decoding falls
//! back to when no suffix is present.

use super::Placement;
use crate::backend::{GetResult, SearchHit};
use crate::types::{Item, ItemMeta, TenantId};
use serde_json::Value;

/// Physical document id for an item.
pub fn document_id(tenant: &TenantId, item_id: &str, item_type: &str, placement: Placement) -> String {
    match placement {
        Placement::Shared => format!("{}_{}_{}", tenant, item_id, item_type.to_lowercase()),
        _ => format!("{}_{}", tenant, item_id),
    }
}

/// Logical item id recovered from a physical document id.
///
/// `source` supplies the legacy fallback: ids written before type suffixing
/// have no suffix to strip, but always stored the plain item id in the
/// document body.
pub fn item_id_from_document_id(
    doc_id: &str,
    tenant: &TenantId,
    item_type: &str,
    placement: Placement,
    source: &Value,
) -> String {
    let tenant_prefix = format!("{}_", tenant);
    let without_tenant = doc_id.strip_prefix(&tenant_prefix).unwrap_or(doc_id);

    if placement == Placement::Shared {
        let suffix = format!("_{}", item_type.to_lowercase());
        if let Some(stripped) = without_tenant.strip_suffix(&suffix) {
            return stripped.to_string();
        }
        // Trust the stored field only when migration did not leave the type
        // suffix on it as well.
        if let Some(stored) = source.get("itemId").and_then(Value::as_str) {
            if !stored.ends_with(&suffix) {
                return stored.to_string();
            }
        }
    }
    without_tenant.to_string()
}

/// Source document for an item: its JSON body with the identity fields the
/// query layer filters on.
pub fn to_source(item: &Item) -> Value {
    let mut source = item.source.clone();
    if !source.is_object() {
        source = Value::Object(serde_json::Map::new());
    }
    let fields = source.as_object_mut().expect("object ensured above");
    fields.insert("itemId".into(), Value::String(item.item_id.clone()));
    fields.insert("itemType".into(), Value::String(item.item_type.clone()));
    fields.insert(
        "tenantId".into(),
        Value::String(item.tenant_id.as_str().to_string()),
    );
    source
}

fn decode(
    doc_id: &str,
    index: String,
    seq_no: u64,
    primary_term: u64,
    source: Value,
    tenant: &TenantId,
    item_type: &str,
    placement: Placement,
) -> Item {
    let item_id = item_id_from_document_id(doc_id, tenant, item_type, placement, &source);
    Item {
        item_id,
        item_type: item_type.to_string(),
        tenant_id: tenant.clone(),
        source,
        meta: ItemMeta {
            seq_no: Some(seq_no),
            primary_term: Some(primary_term),
            index: Some(index),
            tenant_id: Some(tenant.clone()),
        },
    }
}

pub fn item_from_get(
    result: GetResult,
    tenant: &TenantId,
    item_type: &str,
    placement: Placement,
) -> Item {
    decode(
        &result.id,
        result.index,
        result.seq_no,
        result.primary_term,
        result.source,
        tenant,
        item_type,
        placement,
    )
}

pub fn item_from_hit(
    hit: SearchHit,
    tenant: &TenantId,
    item_type: &str,
    placement: Placement,
) -> Item {
    decode(
        &hit.id,
        hit.index,
        hit.seq_no,
        hit.primary_term,
        hit.source,
        tenant,
        item_type,
        placement,
    )
}
