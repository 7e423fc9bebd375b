//! Rolling-index bring-up.
//!
//! Rolling types need three backend artifacts before the first write: a
//! lifecycle policy driving rollover, a per-type index template binding new
//! generations to the policy and the write alias, and the first numbered
//! index behind the alias. Bring-up is idempotent; a restart against an
//! already provisioned backend changes nothing.
//!
//! Template propagation is not synchronous on clustered backends, so the
//! first generation is created only after the template is visible, and its
//! effective settings are verified afterwards. The folding analyzer is the
//! canary: if it is missing, the index was created bare and every keyword
//! search against it would differ from the other generations.

use super::IndexRouter;
use crate::backend::{AliasSpec, SearchBackend};
use crate::config::RolloverConfig;
use crate::error::{GriddleError, Result};
use serde_json::{json, Value};
use std::time::Duration;

const TEMPLATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const VERIFY_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Provisions every rolling type. Call once at startup, before the store
/// accepts writes.
pub async fn bring_up(
    backend: &dyn SearchBackend,
    router: &IndexRouter,
    config: &RolloverConfig,
) -> Result<()> {
    let policy_name = lifecycle_policy_name(router.prefix());
    if !backend.lifecycle_policy_exists(&policy_name).await? {
        backend
            .put_lifecycle_policy(&policy_name, &lifecycle_policy_body(config))
            .await?;
        tracing::info!(policy = %policy_name, "created rollover lifecycle policy");
    }

    let rolling: Vec<String> = router
        .registry()
        .rolling_types()
        .map(String::from)
        .collect();
    for item_type in rolling {
        bring_up_type(backend, router, config, &policy_name, &item_type).await?;
    }
    Ok(())
}

async fn bring_up_type(
    backend: &dyn SearchBackend,
    router: &IndexRouter,
    config: &RolloverConfig,
    policy_name: &str,
    item_type: &str,
) -> Result<()> {
    let alias = router.base_name(item_type);
    let template_name = format!("{}-rollover-template", alias);

    backend
        .put_index_template(&template_name, &template_body(&alias, policy_name, config))
        .await?;
    wait_for_template(backend, config, &template_name).await?;

    // Any existing generation means a previous run (or rollover) owns the
    // alias already.
    if !backend.resolve_alias(&alias).await?.is_empty() {
        tracing::debug!(alias = %alias, "rolling index already provisioned");
        return Ok(());
    }

    let first = router.first_generation(item_type);
    if !backend.index_exists(&first).await? {
        backend
            .create_index(&first, &json!({}), &[AliasSpec::write(&alias)])
            .await?;
        tracing::info!(index = %first, alias = %alias, "created first rolling generation");
    }

    verify_template_applied(backend, config, &first, &alias).await
}

async fn wait_for_template(
    backend: &dyn SearchBackend,
    config: &RolloverConfig,
    template_name: &str,
) -> Result<()> {
    for _ in 0..config.bring_up_attempts {
        if backend.index_template_exists(template_name).await? {
            return Ok(());
        }
        tokio::time::sleep(TEMPLATE_POLL_INTERVAL).await;
    }
    Err(GriddleError::BringUp {
        index: template_name.to_string(),
        reason: "index template never became visible".to_string(),
    })
}

/// Confirms the new index picked up its template by probing for the folding
/// analyzer in its effective settings. Index settings are fixed at creation,
/// so a create that raced the template cannot be repaired in place: the bare
/// index is deleted and recreated, with growing delays between bounded
/// attempts.
async fn verify_template_applied(
    backend: &dyn SearchBackend,
    config: &RolloverConfig,
    index: &str,
    alias: &str,
) -> Result<()> {
    for attempt in 1..=config.bring_up_attempts {
        let settings = backend.get_index_settings(index).await?;
        if settings
            .pointer("/settings/analysis/analyzer/folding")
            .is_some()
        {
            return Ok(());
        }
        tracing::warn!(
            index,
            attempt,
            "index was created without the folding analyzer, recreating it"
        );
        backend.delete_index(index).await?;
        tokio::time::sleep(VERIFY_BACKOFF_STEP * attempt).await;
        backend
            .create_index(index, &json!({}), &[AliasSpec::write(alias)])
            .await?;
    }
    let settings = backend.get_index_settings(index).await?;
    if settings
        .pointer("/settings/analysis/analyzer/folding")
        .is_some()
    {
        return Ok(());
    }
    Err(GriddleError::BringUp {
        index: index.to_string(),
        reason: "index settings never picked up the rollover template".to_string(),
    })
}

fn lifecycle_policy_name(prefix: &str) -> String {
    format!("{}-rollover-lifecycle-policy", prefix)
}

fn lifecycle_policy_body(config: &RolloverConfig) -> Value {
    let mut rollover = serde_json::Map::new();
    if let Some(max_age) = &config.max_age {
        rollover.insert("max_age".into(), json!(max_age));
    }
    if let Some(max_size) = &config.max_size {
        rollover.insert("max_size".into(), json!(max_size));
    }
    if let Some(max_docs) = config.max_docs {
        rollover.insert("max_docs".into(), json!(max_docs));
    }
    json!({
        "policy": {
            "phases": {
                "hot": {
                    "actions": {
                        "rollover": Value::Object(rollover)
                    }
                }
            }
        }
    })
}

fn template_body(alias: &str, policy_name: &str, config: &RolloverConfig) -> Value {
    json!({
        "index_patterns": [format!("{}-*", alias)],
        "template": {
            "settings": {
                "number_of_shards": config.number_of_shards,
                "number_of_replicas": config.number_of_replicas,
                "mapping": {"total_fields": {"limit": config.mapping_total_fields_limit}},
                "max_docvalue_fields_search": config.max_doc_value_fields_search,
                "analysis": {
                    "analyzer": {
                        "folding": {
                            "type": "custom",
                            "tokenizer": "keyword",
                            "filter": ["lowercase", "asciifolding"]
                        }
                    }
                },
                "lifecycle": {
                    "name": policy_name,
                    "rollover_alias": alias
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::index::TypeRegistry;

    fn router() -> IndexRouter {
        IndexRouter::new("ctx", TypeRegistry::default())
    }

    #[tokio::test]
    async fn bring_up_provisions_policy_template_and_first_generation() {
        let backend = InMemoryBackend::new();
        let router = router();
        bring_up(&backend, &router, &RolloverConfig::default())
            .await
            .unwrap();

        assert!(backend
            .lifecycle_policy_exists("ctx-rollover-lifecycle-policy")
            .await
            .unwrap());
        assert!(backend
            .index_template_exists("ctx-session-rollover-template")
            .await
            .unwrap());
        assert!(backend.index_exists("ctx-session-000001").await.unwrap());
        assert!(backend.index_exists("ctx-event-000001").await.unwrap());

        let targets = backend.resolve_alias("ctx-session").await.unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].is_write_index);
        assert_eq!(targets[0].index, "ctx-session-000001");
    }

    #[tokio::test]
    async fn bring_up_is_idempotent() {
        let backend = InMemoryBackend::new();
        let router = router();
        let config = RolloverConfig::default();
        bring_up(&backend, &router, &config).await.unwrap();
        bring_up(&backend, &router, &config).await.unwrap();

        let targets = backend.resolve_alias("ctx-event").await.unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn bring_up_leaves_rolled_over_aliases_alone() {
        let backend = InMemoryBackend::new();
        let router = router();
        let config = RolloverConfig::default();
        bring_up(&backend, &router, &config).await.unwrap();

        // Simulate a lifecycle rollover to generation 2.
        backend
            .create_index(
                "ctx-event-000002",
                &json!({}),
                &[AliasSpec::write("ctx-event")],
            )
            .await
            .unwrap();
        bring_up(&backend, &router, &config).await.unwrap();

        let targets = backend.resolve_alias("ctx-event").await.unwrap();
        assert_eq!(targets.len(), 2);
        let write: Vec<_> = targets.iter().filter(|t| t.is_write_index).collect();
        assert_eq!(write.len(), 1);
        assert_eq!(write[0].index, "ctx-event-000002");
    }

    #[tokio::test]
    async fn bare_preexisting_generation_is_recreated_with_the_template() {
        let backend = InMemoryBackend::new();
        // Created before the template existed: no settings, no alias.
        backend
            .create_index("ctx-session-000001", &json!({}), &[])
            .await
            .unwrap();

        let router = router();
        bring_up(&backend, &router, &RolloverConfig::default())
            .await
            .unwrap();

        let settings = backend
            .get_index_settings("ctx-session-000001")
            .await
            .unwrap();
        assert!(settings
            .pointer("/settings/analysis/analyzer/folding")
            .is_some());

        let targets = backend.resolve_alias("ctx-session").await.unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].is_write_index);
        assert_eq!(targets[0].index, "ctx-session-000001");
    }

    #[tokio::test]
    async fn new_generations_inherit_the_folding_analyzer() {
        let backend = InMemoryBackend::new();
        let router = router();
        bring_up(&backend, &router, &RolloverConfig::default())
            .await
            .unwrap();

        let settings = backend
            .get_index_settings("ctx-session-000001")
            .await
            .unwrap();
        let analyzer = settings
            .pointer("/settings/analysis/analyzer/folding")
            .unwrap();
        assert_eq!(analyzer["tokenizer"], json!("keyword"));
        assert_eq!(analyzer["filter"], json!(["lowercase", "asciifolding"]));
        assert_eq!(
            settings.pointer("/settings/lifecycle/rollover_alias"),
            Some(&json!("ctx-session"))
        );
    }
}
