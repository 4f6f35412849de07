//! Status reporting: mirrors the observed release state onto the resource's
//! status sub-resource and, when the resource opts in, to an external
//! webhook.
//!
//! The write is change-gated: a pass that observes the same status as the
//! one already recorded touches neither the cluster nor the webhook.

use std::sync::Arc;
use std::time::Duration;

use chartkeeper_crd::{ChartRelease, ChartReleaseStatus, ReleaseSummary, annotation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::backend::{BackendError, ReleaseBackend, ReleaseContent};
use crate::pass::StatusOverride;
use crate::release::ReleaseStatus;
use crate::store::ResourceStore;
use crate::{Result, Settings};

/// Status code recorded while the resource is cordoned.
pub const STATUS_CORDONED: &str = "cordoned";
/// Status code recorded when the release is absent from the backend.
pub const STATUS_NOT_INSTALLED: &str = "not-installed";
/// Status code recorded when the backend rejected the release values.
pub const STATUS_VALIDATION_FAILED: &str = "validation-failed";
/// Status code recorded when the rendered manifests were rejected.
pub const STATUS_INVALID_MANIFEST: &str = "invalid-manifest";

/// Reports the observed release status on the resource.
pub struct StatusResource {
    backend: Arc<dyn ReleaseBackend>,
    store: Arc<dyn ResourceStore>,
    http: reqwest::Client,
    webhook_timeout: Duration,
}

/// Payload delivered to the status webhook.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_deployed: Option<String>,
    app_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

impl StatusResource {
    /// Builds the resource from its collaborators.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ReleaseBackend>,
        store: Arc<dyn ResourceStore>,
        settings: &Settings,
    ) -> Self {
        Self {
            backend,
            store,
            http: reqwest::Client::new(),
            webhook_timeout: settings.webhook_timeout,
        }
    }

    /// Runs the status step of a pass. An override from an earlier step wins
    /// over a backend query; otherwise the backend is the source of truth,
    /// and a release it does not know about leaves the status untouched.
    #[instrument(skip(self, cr, status_override), fields(release = %cr.spec.release_name))]
    pub async fn ensure(
        &self,
        cr: &ChartRelease,
        status_override: Option<&StatusOverride>,
    ) -> Result<()> {
        if let Some(status_override) = status_override {
            let desired = override_status(cr, status_override);
            return self.set_status(cr, desired).await;
        }

        let content = match self.backend.inspect(&cr.spec.namespace, &cr.spec.release_name).await
        {
            Ok(content) => content,
            Err(BackendError::ReleaseNotFound) => {
                debug!("release not installed, leaving status untouched");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.set_status(cr, compute_status(cr, &content)).await
    }

    async fn set_status(&self, cr: &ChartRelease, desired: ChartReleaseStatus) -> Result<()> {
        if cr.status.as_ref() == Some(&desired) {
            debug!("status already up to date");
            return Ok(());
        }

        // Delivery is best effort; a dead webhook must not wedge the status
        // write behind it.
        if let Some(url) = annotation::webhook_url(cr.meta()) {
            if let Err(err) = self.notify_webhook(cr, url, &desired).await {
                error!(error = %err, url, "status webhook delivery failed");
            }
        }

        debug!(status = %desired.release.status, "updating resource status");
        self.store.update_status(cr, desired).await
    }

    async fn notify_webhook(
        &self,
        cr: &ChartRelease,
        url: &str,
        status: &ChartReleaseStatus,
    ) -> Result<()> {
        let body = WebhookRequest {
            status: &status.release.status,
            reason: status.reason.as_deref(),
            version: &status.version,
            last_deployed: status
                .release
                .last_deployed
                .as_ref()
                .map(|ts| ts.0.to_rfc3339()),
            app_version: &status.app_version,
            token: annotation::webhook_token(cr.meta()),
        };

        let response = self
            .http
            .patch(url)
            .timeout(self.webhook_timeout)
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(crate::Error::Message(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Builds the status carrying a reason recorded by an earlier pipeline step.
fn override_status(cr: &ChartRelease, status_override: &StatusOverride) -> ChartReleaseStatus {
    ChartReleaseStatus {
        reason: Some(status_override.reason.clone()),
        release: ReleaseSummary {
            status: status_override.status.clone(),
            ..ReleaseSummary::default()
        },
        version: cr.spec.version.clone(),
        ..ChartReleaseStatus::default()
    }
}

/// Maps the backend snapshot onto the status sub-resource. A cordoned
/// resource reports the cordon instead of the backend status; the reason is
/// only carried while the release deviates from the deployed state.
fn compute_status(cr: &ChartRelease, content: &ReleaseContent) -> ChartReleaseStatus {
    let cordoned = annotation::is_cordoned(cr.meta());

    let status = if cordoned {
        STATUS_CORDONED.to_string()
    } else {
        content.status.as_code().to_string()
    };

    let reason = if cordoned {
        annotation::cordon_reason(cr.meta()).map(str::to_string)
    } else if content.status != ReleaseStatus::Deployed && !content.description.is_empty() {
        Some(content.description.clone())
    } else {
        None
    };

    ChartReleaseStatus {
        app_version: content.app_version.clone(),
        reason,
        release: ReleaseSummary {
            last_deployed: content.last_deployed.map(Time),
            revision: content.revision,
            status,
        },
        version: content.version.clone(),
    }
}
