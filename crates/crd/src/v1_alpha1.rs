//! v1Alpha1 CRD resources

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a namespaced object that carries chart values under the
/// `values` data key.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesSourceRef {
    /// Name of the referenced object
    #[schemars(length(min = 1, max = 253))]
    pub name: String,
    /// Namespace of the referenced object
    #[schemars(length(min = 1, max = 63))]
    pub namespace: String,
}

/// Configuration value sources merged into the release values. At most one
/// config map and one secret may be referenced; a shared top-level key
/// between the two is a configuration authoring error.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartReleaseConfig {
    /// Plain-text values source
    pub config_map: Option<ValuesSourceRef>,
    /// Confidential values source
    pub secret: Option<ValuesSourceRef>,
}

/// Spec object for the `ChartRelease` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(kind = "ChartRelease", group = "chartkeeper.dev", version = "v1alpha1")]
#[kube(status = "ChartReleaseStatus", shortname = "chr")]
#[kube(namespaced)]
pub struct ChartReleaseSpec {
    /// Name of the release on the backend
    #[schemars(length(min = 1, max = 53))]
    #[schemars(regex(pattern = r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$"))]
    pub release_name: String,
    /// Namespace the release is installed into
    #[schemars(length(min = 1, max = 63))]
    pub namespace: String,
    /// URL of the chart tarball to install
    #[schemars(length(min = 1, max = 2048))]
    pub tarball_url: String,
    /// Target chart version
    #[schemars(length(min = 1, max = 128))]
    pub version: String,
    /// Optional configuration value sources
    pub config: Option<ChartReleaseConfig>,
}

/// Observed release information recorded on the status sub-resource
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSummary {
    /// When the release was last deployed
    pub last_deployed: Option<Time>,
    /// Revision counter reported by the backend
    #[schemars(range(min = 0))]
    pub revision: i64,
    /// Release status code
    pub status: String,
}

/// State object for the `ChartRelease` CRD
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartReleaseStatus {
    /// Upstream application version packaged in the chart
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    /// Human-readable reason, populated when the release deviates from the
    /// deployed state or the resource is cordoned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Observed release information
    pub release: ReleaseSummary,
    /// Deployed chart version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}
