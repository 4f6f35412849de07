//! Resource store seam: reads value sources and persists the bounded set of
//! mutations the reconciler owns (annotations subset and the status
//! sub-resource). The kube-backed implementation is the only one shipped;
//! tests script a mock.

use async_trait::async_trait;
use chartkeeper_crd::{ChartRelease, ChartReleaseStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::{Error, Result};

/// Data key holding the JSON values payload in config maps and secrets.
pub const VALUES_KEY: &str = "values";

/// Kind of values source object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Plain-text values
    ConfigMap,
    /// Confidential values
    Secret,
}

impl SourceKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
        }
    }
}

/// Persistence operations the reconciliation core needs.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Reads the raw JSON values payload from a referenced source object.
    /// `Ok(None)` means the object exists but carries no values; a missing
    /// object is a [`Error::SourceNotFound`].
    async fn source_values(
        &self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>>;

    /// Sets or removes (on `None`) a single annotation on the resource.
    async fn annotate(&self, cr: &ChartRelease, key: &str, value: Option<String>) -> Result<()>;

    /// Replaces the resource's status sub-resource.
    async fn update_status(&self, cr: &ChartRelease, status: ChartReleaseStatus) -> Result<()>;
}

/// [`ResourceStore`] backed by the cluster API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wraps a kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api(&self, cr: &ChartRelease) -> Result<Api<ChartRelease>> {
        let ns = cr
            .namespace()
            .ok_or_else(|| Error::from("Unable to get source namespace".to_string()))?;
        Ok(Api::namespaced(self.client.clone(), &ns))
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn source_values(
        &self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let missing = || Error::SourceNotFound {
            kind: kind.as_str(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        };

        match kind {
            SourceKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let cm = match api.get(name).await {
                    Ok(cm) => cm,
                    Err(err) if is_not_found(&err) => return Err(missing()),
                    Err(err) => return Err(err.into()),
                };
                Ok(cm.data.and_then(|data| data.get(VALUES_KEY).cloned()))
            }
            SourceKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let secret = match api.get(name).await {
                    Ok(secret) => secret,
                    Err(err) if is_not_found(&err) => return Err(missing()),
                    Err(err) => return Err(err.into()),
                };
                let Some(bytes) = secret.data.and_then(|mut data| data.remove(VALUES_KEY)) else {
                    return Ok(None);
                };
                String::from_utf8(bytes.0)
                    .map(Some)
                    .map_err(|err| Error::Message(format!("secret values are not utf-8: {err}")))
            }
        }
    }

    async fn annotate(&self, cr: &ChartRelease, key: &str, value: Option<String>) -> Result<()> {
        let api = self.namespaced_api(cr)?;
        let name = cr.name_any();

        debug!(annotation = key, set = value.is_some(), "patching annotation");

        // A null value in a merge patch removes the annotation.
        let patch = json!({"metadata": {"annotations": {key: value}}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn update_status(&self, cr: &ChartRelease, status: ChartReleaseStatus) -> Result<()> {
        let api = self.namespaced_api(cr)?;
        let name = cr.name_any();

        let status_patch = Patch::Merge(json!({"status": serde_json::to_value(status)?}));
        api.patch_status(&name, &PatchParams::default(), &status_patch)
            .await?;

        Ok(())
    }
}
