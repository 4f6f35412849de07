//! Change application with bounded waits and backend error classification.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chartkeeper_crd::{ChartRelease, annotation};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::{ReleaseState, ReleaseStatus};
use super::ReleaseResource;
use crate::backend::BackendError;
use crate::pass::PassOutcome;
use crate::status::{STATUS_INVALID_MANIFEST, STATUS_NOT_INSTALLED, STATUS_VALIDATION_FAILED};
use crate::{Error, Result};

/// Installs get a short fixed bound: it only needs to cover the dispatch,
/// the install itself is observed on the next pass.
const CREATE_WAIT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug)]
enum ApplyKind {
    Install,
    Upgrade,
}

impl ApplyKind {
    fn verb(self) -> &'static str {
        match self {
            Self::Install => "created",
            Self::Upgrade => "updated",
        }
    }
}

impl ReleaseResource {
    /// Installs the planned release.
    pub(super) async fn apply_create(
        &self,
        cr: &ChartRelease,
        state: &ReleaseState,
    ) -> Result<PassOutcome> {
        self.apply_chart(cr, state, ApplyKind::Install, CREATE_WAIT)
            .await
    }

    /// Upgrades the planned release.
    pub(super) async fn apply_update(
        &self,
        cr: &ChartRelease,
        state: &ReleaseState,
    ) -> Result<PassOutcome> {
        self.apply_chart(cr, state, ApplyKind::Upgrade, self.settings.update_wait)
            .await
    }

    async fn apply_chart(
        &self,
        cr: &ChartRelease,
        state: &ReleaseState,
        kind: ApplyKind,
        wait: Duration,
    ) -> Result<PassOutcome> {
        if state.is_empty() {
            debug!("no release planned, nothing to apply");
            return Ok(PassOutcome::done());
        }

        let tarball_url = &cr.spec.tarball_url;
        let chart_path = match self.backend.fetch_chart(tarball_url).await {
            Ok(path) => path,
            Err(err) if err.is_fetch_error() => {
                let reason = err.to_string();
                warn!(%reason, "canceling pass, chart fetch will be retried");
                return Ok(PassOutcome::cancel().with_status(reason, STATUS_NOT_INSTALLED));
            }
            Err(err) => return Err(err.into()),
        };

        // The backend call runs as its own task and is never aborted: killing
        // an in-flight release mutation could leave the backend inconsistent.
        // If the bound elapses the call keeps running and the next pass
        // observes its outcome through the state resolver.
        let mut task = self.dispatch(cr, state, kind, &chart_path);

        let result = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(err) => Err(BackendError::Other(err.to_string())),
            },
            () = tokio::time::sleep(wait) => {
                // Persist the checksum now so the next pass's diff sees
                // "already attempted" and does not dispatch a duplicate.
                self.persist_checksum(cr, state).await?;

                let chart_path = chart_path.clone();
                tokio::spawn(async move {
                    let _ = task.await;
                    cleanup_staging(&chart_path).await;
                });

                debug!(
                    wait_secs = wait.as_secs(),
                    "release still being applied, canceling pass"
                );
                return Ok(PassOutcome::cancel());
            }
        };

        cleanup_staging(&chart_path).await;

        match result {
            Ok(()) => {
                self.persist_checksum(cr, state).await?;
                info!(release = %state.name, "{} release", kind.verb());
                Ok(PassOutcome::done())
            }
            Err(BackendError::ValidationFailed(message)) => {
                debug!(release = %state.name, %message, "backend rejected the release values");
                Ok(PassOutcome::cancel().with_status(
                    format!("validation error: ({message})"),
                    STATUS_VALIDATION_FAILED,
                ))
            }
            Err(BackendError::InvalidManifest(message)) => {
                debug!(release = %state.name, %message, "release manifests are invalid");
                Ok(PassOutcome::cancel().with_status(
                    format!("invalid manifest error: ({message})"),
                    STATUS_INVALID_MANIFEST,
                ))
            }
            Err(BackendError::ReleaseNotFound) => {
                // The backend lost the release mid-operation; re-resolve on
                // the next pass.
                warn!(release = %state.name, "release disappeared during apply");
                Ok(PassOutcome::cancel().with_status(
                    format!("release {:?} not found", state.name),
                    STATUS_NOT_INSTALLED,
                ))
            }
            Err(err) => self.classify_apply_failure(cr, state, &err).await,
        }
    }

    fn dispatch(
        &self,
        cr: &ChartRelease,
        state: &ReleaseState,
        kind: ApplyKind,
        chart_path: &Path,
    ) -> JoinHandle<std::result::Result<(), BackendError>> {
        let backend = Arc::clone(&self.backend);
        let namespace = cr.spec.namespace.clone();
        let name = state.name.clone();
        let values = state.values.clone();
        let chart_path = chart_path.to_path_buf();

        tokio::spawn(async move {
            match kind {
                ApplyKind::Install => {
                    backend.install(&namespace, &name, &chart_path, &values).await
                }
                ApplyKind::Upgrade => {
                    backend.upgrade(&namespace, &name, &chart_path, &values).await
                }
            }
        })
    }

    /// An unclassified backend failure may still have left the release in a
    /// recorded failed state; if so the status reporter picks it up and the
    /// planner's unchanged-failed rule stops the replay. Otherwise it is
    /// fatal and the pipeline retries with backoff.
    async fn classify_apply_failure(
        &self,
        cr: &ChartRelease,
        state: &ReleaseState,
        err: &BackendError,
    ) -> Result<PassOutcome> {
        debug!(release = %state.name, %err, "release apply failed");

        match self.backend.inspect(&cr.spec.namespace, &state.name).await {
            Err(BackendError::ReleaseNotFound) => Ok(PassOutcome::cancel()
                .with_status(format!("backend error: ({err})"), STATUS_NOT_INSTALLED)),
            Err(inspect_err) => Err(inspect_err.into()),
            Ok(content) if content.status == ReleaseStatus::Failed => {
                debug!(release = %content.name, "backend recorded a failed release");
                Ok(PassOutcome::cancel()
                    .with_status(content.description, ReleaseStatus::Failed.as_code()))
            }
            Ok(_) => Err(Error::BackendError(err.clone())),
        }
    }

    /// Deletes the planned release. A release the backend still reports
    /// after the delete keeps the finalizer for a retry next pass.
    pub(super) async fn apply_delete(
        &self,
        cr: &ChartRelease,
        state: &ReleaseState,
    ) -> Result<PassOutcome> {
        if state.is_empty() {
            debug!("no release planned, nothing to delete");
            return Ok(PassOutcome::done());
        }

        let namespace = &cr.spec.namespace;
        debug!(release = %state.name, "deleting release");

        match self.backend.uninstall(namespace, &state.name).await {
            Ok(()) => {}
            Err(BackendError::ReleaseNotFound) => {
                debug!(release = %state.name, "release already deleted");
                return Ok(PassOutcome::done());
            }
            Err(err) => return Err(err.into()),
        }

        match self.backend.inspect(namespace, &state.name).await {
            Err(BackendError::ReleaseNotFound) => {
                info!(release = %state.name, "deleted release");
                Ok(PassOutcome::done())
            }
            Ok(_) => {
                debug!(release = %state.name, "release still exists, keeping finalizer");
                Ok(PassOutcome::cancel().keeping_finalizer())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn persist_checksum(&self, cr: &ChartRelease, state: &ReleaseState) -> Result<()> {
        self.store
            .annotate(
                cr,
                annotation::VALUES_CHECKSUM,
                Some(state.values_checksum.clone()),
            )
            .await
    }
}

/// Best-effort removal of the chart staging directory; failures are logged,
/// never escalated.
async fn cleanup_staging(chart_path: &Path) {
    let staging = chart_path.parent().unwrap_or(chart_path);
    if let Err(err) = tokio::fs::remove_dir_all(staging).await {
        warn!(%err, path = %staging.display(), "failed to remove chart staging directory");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chartkeeper_crd::v1_alpha1::ChartReleaseSpec;
    use serde_json::json;

    use super::*;
    use crate::Settings;
    use crate::backend::mock::{MockBackend, MockCall};
    use crate::backend::ReleaseContent;
    use crate::store::mock::MockStore;

    fn cr() -> ChartRelease {
        ChartRelease::new(
            "r1",
            ChartReleaseSpec {
                release_name: "r1".to_string(),
                namespace: "default".to_string(),
                tarball_url: "https://charts.test/r1-1.0.0.tgz".to_string(),
                version: "1.0.0".to_string(),
                config: None,
            },
        )
    }

    fn desired(checksum: &str) -> ReleaseState {
        ReleaseState {
            name: "r1".to_string(),
            status: Some(ReleaseStatus::Deployed),
            values: json!({"replicas": 3}).as_object().cloned().unwrap(),
            values_checksum: checksum.to_string(),
            version: "1.0.0".to_string(),
        }
    }

    fn harness(backend: MockBackend) -> (ReleaseResource, Arc<MockStore>, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let store = Arc::new(MockStore::default());
        let release = ReleaseResource::new(backend.clone(), store.clone(), Settings::default());
        (release, store, backend)
    }

    #[tokio::test]
    async fn create_installs_and_persists_checksum() {
        let backend = MockBackend::default();
        let (release, store, _) = harness(backend);

        let outcome = release.apply_create(&cr(), &desired("c1")).await.unwrap();

        assert_eq!(outcome, PassOutcome::done());
        assert_eq!(
            store.annotations(),
            vec![(
                annotation::VALUES_CHECKSUM.to_string(),
                Some("c1".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn fetch_failure_cancels_with_reason() {
        let backend = MockBackend::default();
        *backend.fetch_error.lock().unwrap() = Some(BackendError::FetchNotFound {
            url: "https://charts.test/r1-1.0.0.tgz".to_string(),
        });
        let (release, store, _) = harness(backend);

        let outcome = release.apply_create(&cr(), &desired("c1")).await.unwrap();

        assert!(outcome.cancelled);
        let status = outcome.status_override.unwrap();
        assert_eq!(status.status, STATUS_NOT_INSTALLED);
        assert!(status.reason.contains("not found"));
        // No checksum persisted: nothing was dispatched.
        assert!(store.annotations().is_empty());
    }

    #[tokio::test]
    async fn validation_failure_cancels_with_failed_status() {
        let backend = MockBackend::default();
        *backend.install_error.lock().unwrap() =
            Some(BackendError::ValidationFailed("schema mismatch".to_string()));
        let (release, store, _) = harness(backend);

        let outcome = release.apply_create(&cr(), &desired("c1")).await.unwrap();

        assert!(outcome.cancelled);
        let status = outcome.status_override.unwrap();
        assert_eq!(status.status, STATUS_VALIDATION_FAILED);
        assert!(status.reason.contains("schema mismatch"));
        assert!(store.annotations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dispatch_persists_checksum_and_cancels() {
        let backend = MockBackend::default();
        // Far beyond the create bound; the dispatch continues unobserved.
        *backend.dispatch_delay.lock().unwrap() = Some(Duration::from_secs(600));
        let (release, store, _) = harness(backend);

        let outcome = release.apply_create(&cr(), &desired("c1")).await.unwrap();

        assert_eq!(outcome, PassOutcome::cancel());
        assert_eq!(
            store.annotations(),
            vec![(
                annotation::VALUES_CHECKSUM.to_string(),
                Some("c1".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn update_dispatches_upgrade() {
        let backend = MockBackend::default();
        let (release, _, _) = harness(backend);

        let outcome = release.apply_update(&cr(), &desired("c2")).await.unwrap();
        assert_eq!(outcome, PassOutcome::done());
    }

    #[tokio::test]
    async fn unclassified_failure_with_failed_release_cancels() {
        let backend = MockBackend::with_release(ReleaseContent {
            name: "r1".to_string(),
            status: ReleaseStatus::Failed,
            description: "hook timed out".to_string(),
            ..ReleaseContent::default()
        });
        *backend.upgrade_error.lock().unwrap() =
            Some(BackendError::Other("connection reset".to_string()));
        let (release, _, _) = harness(backend);

        let outcome = release.apply_update(&cr(), &desired("c2")).await.unwrap();

        assert!(outcome.cancelled);
        let status = outcome.status_override.unwrap();
        assert_eq!(status.status, "failed");
        assert_eq!(status.reason, "hook timed out");
    }

    #[tokio::test]
    async fn unclassified_failure_without_failed_release_is_fatal() {
        let backend = MockBackend::with_release(ReleaseContent {
            name: "r1".to_string(),
            status: ReleaseStatus::Deployed,
            ..ReleaseContent::default()
        });
        *backend.upgrade_error.lock().unwrap() =
            Some(BackendError::Other("connection reset".to_string()));
        let (release, _, _) = harness(backend);

        let err = release.apply_update(&cr(), &desired("c2")).await.unwrap_err();
        assert!(matches!(err, Error::BackendError(BackendError::Other(_))));
    }

    #[tokio::test]
    async fn delete_treats_not_found_as_success() {
        let backend = MockBackend::default();
        *backend.uninstall_error.lock().unwrap() = Some(BackendError::ReleaseNotFound);
        let (release, _, _) = harness(backend);

        let outcome = release.apply_delete(&cr(), &desired("c1")).await.unwrap();
        assert_eq!(outcome, PassOutcome::done());
    }

    #[tokio::test]
    async fn delete_keeps_finalizer_while_release_lingers() {
        // Uninstall succeeds but the follow-up inspect still sees the
        // release (eventual consistency).
        let backend = MockBackend::with_release(ReleaseContent {
            name: "r1".to_string(),
            status: ReleaseStatus::Uninstalling,
            ..ReleaseContent::default()
        });
        let (release, _, backend) = harness(backend);

        let outcome = release.apply_delete(&cr(), &desired("c1")).await.unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.keep_finalizer);
        assert_eq!(
            backend.calls(),
            vec![MockCall::Uninstall {
                namespace: "default".to_string(),
                name: "r1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn empty_state_is_a_no_op() {
        let (release, store, backend) = harness(MockBackend::default());

        let outcome = release
            .apply_create(&cr(), &ReleaseState::default())
            .await
            .unwrap();

        assert_eq!(outcome, PassOutcome::done());
        assert!(store.annotations().is_empty());
        assert!(backend.calls().is_empty());
    }
}
