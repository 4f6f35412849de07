//! Contract the reconciler requires from a release backend.
//!
//! The shipped binary wires in the [`helm`] adapter; everything in the
//! reconciliation core is written against the [`ReleaseBackend`] trait so
//! the state machine can be exercised without a cluster.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::release::state::ReleaseStatus;

pub mod helm;

/// Failure modes a backend call can report.
///
/// Fetch and validation variants are handled in place by the change applier;
/// everything that falls through to [`BackendError::Other`] is fatal for the
/// pass and retried with backoff by the pipeline.
#[derive(thiserror::Error, Clone, Debug)]
pub enum BackendError {
    /// The named release does not exist; valid "no state", not a failure
    #[error("release not found")]
    ReleaseNotFound,

    /// Downloading the chart tarball failed
    #[error("pulling chart {url:?} failed: {message}")]
    FetchFailed {
        /// Tarball URL
        url: String,
        /// Backend-reported detail
        message: String,
    },

    /// The chart tarball does not exist at the source
    #[error("chart {url:?} not found")]
    FetchNotFound {
        /// Tarball URL
        url: String,
    },

    /// Downloading the chart tarball hit the configured bound
    #[error("timeout pulling chart {url:?}")]
    FetchTimeout {
        /// Tarball URL
        url: String,
    },

    /// The backend rejected the release values or chart schema
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The rendered manifests are not valid cluster objects
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Anything the reconciler has no targeted handling for
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// True for chart download failures, which cancel the pass and are
    /// retried on the next scheduled pass.
    #[must_use]
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed { .. } | Self::FetchNotFound { .. } | Self::FetchTimeout { .. }
        )
    }
}

/// Snapshot of a release as reported by the backend.
#[derive(Clone, Debug, Default)]
pub struct ReleaseContent {
    /// Release name
    pub name: String,
    /// Backend status code
    pub status: ReleaseStatus,
    /// Values the release was installed with
    pub values: Map<String, Value>,
    /// Deployed chart version
    pub version: String,
    /// Upstream application version packaged in the chart
    pub app_version: String,
    /// Revision counter
    pub revision: i64,
    /// When the release was last deployed
    pub last_deployed: Option<DateTime<Utc>>,
    /// Backend-reported description of the latest operation
    pub description: String,
}

/// Release management operations the reconciler depends on.
///
/// Install and upgrade are dispatched asynchronously by the change applier
/// and must tolerate running to completion after the pass that started them
/// has already returned.
#[async_trait]
pub trait ReleaseBackend: Send + Sync {
    /// Verifies the backend is reachable before a pass mutates anything.
    async fn ready(&self) -> Result<(), BackendError>;

    /// Queries the named release.
    async fn inspect(&self, namespace: &str, name: &str) -> Result<ReleaseContent, BackendError>;

    /// Downloads the chart tarball into a staging directory and returns the
    /// archive path. The caller owns cleanup of the staging directory.
    async fn fetch_chart(&self, tarball_url: &str) -> Result<PathBuf, BackendError>;

    /// Installs a new release from a fetched chart.
    async fn install(
        &self,
        namespace: &str,
        name: &str,
        chart_path: &Path,
        values: &Map<String, Value>,
    ) -> Result<(), BackendError>;

    /// Upgrades an existing release from a fetched chart.
    async fn upgrade(
        &self,
        namespace: &str,
        name: &str,
        chart_path: &Path,
        values: &Map<String, Value>,
    ) -> Result<(), BackendError>;

    /// Removes the named release.
    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), BackendError>;

    /// Rolls the release back to the given revision (0 = previous).
    async fn rollback(
        &self,
        namespace: &str,
        name: &str,
        revision: i64,
    ) -> Result<(), BackendError>;
}
