//! Desired state resolution: merged values, checksum, target version.

use chartkeeper_crd::ChartRelease;
use chartkeeper_crd::v1_alpha1::ValuesSourceRef;
use kube::Resource;
use serde_json::{Map, Value};
use tracing::debug;

use super::state::{self, ReleaseState, ReleaseStatus};
use super::ReleaseResource;
use crate::store::SourceKind;
use crate::{Error, Result};

impl ReleaseResource {
    /// Computes the state the release should converge to.
    ///
    /// A resource that is being deleted resolves to name-and-version
    /// bookkeeping only; its value sources may already be gone and are not
    /// consulted.
    pub(super) async fn get_desired_state(&self, cr: &ChartRelease) -> Result<ReleaseState> {
        let name = cr.spec.release_name.clone();
        let version = cr.spec.version.clone();

        if cr.meta().deletion_timestamp.is_some() {
            debug!(release = %name, "resource is being deleted, skipping value sources");
            return Ok(ReleaseState {
                name,
                version,
                ..ReleaseState::default()
            });
        }

        let config = cr.spec.config.as_ref();
        let config_map_values = self
            .source(SourceKind::ConfigMap, config.and_then(|c| c.config_map.as_ref()))
            .await?;
        let secret_values = self
            .source(SourceKind::Secret, config.and_then(|c| c.secret.as_ref()))
            .await?;

        let values = merge_values(config_map_values, secret_values)?;
        let values_checksum = state::values_checksum(&values)?;

        Ok(ReleaseState {
            name,
            status: Some(ReleaseStatus::Deployed),
            values,
            values_checksum,
            version,
        })
    }

    async fn source(
        &self,
        kind: SourceKind,
        source: Option<&ValuesSourceRef>,
    ) -> Result<Map<String, Value>> {
        let Some(source) = source else {
            return Ok(Map::new());
        };

        let payload = self
            .store
            .source_values(kind, &source.namespace, &source.name)
            .await?;

        match payload {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Map::new()),
        }
    }
}

/// Merges the two value payloads. A shared top-level key is ambiguous: the
/// caller cannot know which source should win, so it is a hard conflict.
fn merge_values(
    mut base: Map<String, Value>,
    overlay: Map<String, Value>,
) -> Result<Map<String, Value>> {
    for (key, value) in overlay {
        if base.contains_key(&key) {
            return Err(Error::ValuesConflict(key));
        }
        base.insert(key, value);
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chartkeeper_crd::v1_alpha1::{ChartReleaseConfig, ChartReleaseSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    use super::*;
    use crate::Settings;
    use crate::backend::mock::MockBackend;
    use crate::store::mock::MockStore;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn cr_with_config(config: Option<ChartReleaseConfig>) -> ChartRelease {
        ChartRelease::new(
            "r1",
            ChartReleaseSpec {
                release_name: "r1".to_string(),
                namespace: "default".to_string(),
                tarball_url: "https://charts.test/r1-1.0.0.tgz".to_string(),
                version: "1.0.0".to_string(),
                config,
            },
        )
    }

    fn source_ref(name: &str) -> ValuesSourceRef {
        ValuesSourceRef {
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    fn resource(store: MockStore) -> ReleaseResource {
        ReleaseResource::new(
            Arc::new(MockBackend::default()),
            Arc::new(store),
            Settings::default(),
        )
    }

    #[test]
    fn merge_is_a_disjoint_union() {
        let merged = merge_values(obj(json!({"a": 1})), obj(json!({"b": 2}))).unwrap();
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_rejects_shared_keys() {
        let err = merge_values(obj(json!({"a": 1})), obj(json!({"a": 2}))).unwrap_err();
        assert!(matches!(err, Error::ValuesConflict(key) if key == "a"));
    }

    #[tokio::test]
    async fn desired_state_merges_both_sources() {
        let store = MockStore::default()
            .with_source(SourceKind::ConfigMap, "default", "r1-values", r#"{"a": 1}"#)
            .with_source(SourceKind::Secret, "default", "r1-secrets", r#"{"b": 2}"#);

        let cr = cr_with_config(Some(ChartReleaseConfig {
            config_map: Some(source_ref("r1-values")),
            secret: Some(source_ref("r1-secrets")),
        }));

        let desired = resource(store).get_desired_state(&cr).await.unwrap();

        assert_eq!(desired.name, "r1");
        assert_eq!(desired.version, "1.0.0");
        assert_eq!(desired.status, Some(ReleaseStatus::Deployed));
        assert_eq!(Value::Object(desired.values), json!({"a": 1, "b": 2}));
        assert!(!desired.values_checksum.is_empty());
    }

    #[tokio::test]
    async fn desired_state_without_sources_has_empty_checksum() {
        let cr = cr_with_config(None);
        let desired = resource(MockStore::default())
            .get_desired_state(&cr)
            .await
            .unwrap();

        assert!(desired.values.is_empty());
        assert_eq!(desired.values_checksum, "");
    }

    #[tokio::test]
    async fn missing_source_object_is_fatal() {
        let cr = cr_with_config(Some(ChartReleaseConfig {
            config_map: Some(source_ref("gone")),
            secret: None,
        }));

        let err = resource(MockStore::default())
            .get_desired_state(&cr)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn shared_key_across_sources_is_a_conflict() {
        let store = MockStore::default()
            .with_source(SourceKind::ConfigMap, "default", "r1-values", r#"{"a": 1}"#)
            .with_source(SourceKind::Secret, "default", "r1-secrets", r#"{"a": 2}"#);

        let cr = cr_with_config(Some(ChartReleaseConfig {
            config_map: Some(source_ref("r1-values")),
            secret: Some(source_ref("r1-secrets")),
        }));

        let err = resource(store).get_desired_state(&cr).await.unwrap_err();
        assert!(matches!(err, Error::ValuesConflict(key) if key == "a"));
    }

    #[tokio::test]
    async fn deleted_resource_resolves_to_bookkeeping_only() {
        let mut cr = cr_with_config(Some(ChartReleaseConfig {
            config_map: Some(source_ref("gone")),
            secret: None,
        }));
        cr.meta_mut().deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        // Sources are gone but must not be consulted.
        let desired = resource(MockStore::default())
            .get_desired_state(&cr)
            .await
            .unwrap();

        assert_eq!(desired.name, "r1");
        assert_eq!(desired.version, "1.0.0");
        assert_eq!(desired.status, None);
        assert!(desired.values.is_empty());
    }
}
