//! Helm CLI adapter for the [`ReleaseBackend`] contract.
//!
//! Deliberately thin: every operation shells out to `helm` with JSON output
//! and maps the CLI's failure text onto the backend error taxonomy. The
//! reconciliation core never depends on this module directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{BackendError, ReleaseBackend, ReleaseContent};
use crate::Settings;
use crate::release::state::ReleaseStatus;

/// Release backend backed by the `helm` binary.
pub struct HelmBackend {
    bin: String,
    fetch_timeout: Duration,
    staging_root: PathBuf,
}

#[derive(Deserialize)]
struct HelmRelease {
    name: String,
    #[serde(default)]
    version: i64,
    info: HelmInfo,
    #[serde(default)]
    chart: Option<HelmChart>,
    #[serde(default)]
    config: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct HelmInfo {
    status: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    last_deployed: Option<String>,
}

#[derive(Deserialize)]
struct HelmChart {
    metadata: HelmChartMetadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartMetadata {
    #[serde(default)]
    version: String,
    #[serde(default)]
    app_version: String,
}

impl HelmBackend {
    /// Builds a backend from operator settings.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            bin: settings.helm_bin.clone(),
            fetch_timeout: settings.fetch_timeout,
            staging_root: std::env::temp_dir(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, HelmFailure> {
        debug!(bin = %self.bin, ?args, "running helm");

        // kill_on_drop covers the fetch timeout: dropping the timed-out pull
        // future must not leave a child writing into the staging directory.
        // Install/upgrade futures are awaited to completion by their spawned
        // task, so they are never dropped mid-flight.
        let output = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| HelmFailure::Spawn(err.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(HelmFailure::Command(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    async fn pull_into(&self, staging: &Path, tarball_url: &str) -> Result<PathBuf, BackendError> {
        let staging_arg = staging.display().to_string();

        let args = ["pull", tarball_url, "-d", &staging_arg];
        let pull = self.run(&args);
        match tokio::time::timeout(self.fetch_timeout, pull).await {
            Ok(Ok(_)) => {}
            Ok(Err(failure)) => {
                let stderr = failure.stderr();
                if stderr.contains("404") || stderr.contains("not found") {
                    return Err(BackendError::FetchNotFound {
                        url: tarball_url.to_string(),
                    });
                }
                return Err(BackendError::FetchFailed {
                    url: tarball_url.to_string(),
                    message: stderr.to_string(),
                });
            }
            Err(_) => {
                return Err(BackendError::FetchTimeout {
                    url: tarball_url.to_string(),
                });
            }
        }

        // helm pull writes a single archive into the staging directory
        let mut entries = tokio::fs::read_dir(staging)
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;
        let entry = entries
            .next_entry()
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;

        entry.map(|e| e.path()).ok_or(BackendError::FetchFailed {
            url: tarball_url.to_string(),
            message: "no chart archive in staging directory".to_string(),
        })
    }
}

/// Best-effort removal of a staging directory after a failed fetch.
async fn remove_staging(staging: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(staging).await {
        warn!(%err, path = %staging.display(), "failed to remove chart staging directory");
    }
}

enum HelmFailure {
    Spawn(String),
    Command(String),
}

impl HelmFailure {
    fn stderr(&self) -> &str {
        match self {
            Self::Spawn(message) | Self::Command(message) => message,
        }
    }

    fn into_other(self) -> BackendError {
        BackendError::Other(match self {
            Self::Spawn(message) | Self::Command(message) => message,
        })
    }
}

fn is_release_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found") || stderr.contains("has no deployed releases")
}

fn parse_last_deployed(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[async_trait]
impl ReleaseBackend for HelmBackend {
    async fn ready(&self) -> Result<(), BackendError> {
        self.run(&["version", "--short"])
            .await
            .map(|_| ())
            .map_err(HelmFailure::into_other)
    }

    async fn inspect(&self, namespace: &str, name: &str) -> Result<ReleaseContent, BackendError> {
        let raw = match self
            .run(&["status", name, "-n", namespace, "-o", "json"])
            .await
        {
            Ok(raw) => raw,
            Err(failure) if is_release_not_found(failure.stderr()) => {
                return Err(BackendError::ReleaseNotFound);
            }
            Err(failure) => return Err(failure.into_other()),
        };

        let release: HelmRelease =
            serde_json::from_str(&raw).map_err(|err| BackendError::Other(err.to_string()))?;

        let (version, app_version) = release
            .chart
            .map(|chart| (chart.metadata.version, chart.metadata.app_version))
            .unwrap_or_default();

        Ok(ReleaseContent {
            name: release.name,
            status: ReleaseStatus::from_code(&release.info.status),
            values: release.config.unwrap_or_default(),
            version,
            app_version,
            revision: release.version,
            last_deployed: parse_last_deployed(release.info.last_deployed.as_deref()),
            description: release.info.description,
        })
    }

    async fn fetch_chart(&self, tarball_url: &str) -> Result<PathBuf, BackendError> {
        let staging = tempfile::tempdir_in(&self.staging_root)
            .map_err(|err| BackendError::Other(err.to_string()))?
            .keep();

        // Failed fetches are retried every pass; a leaked staging directory
        // per attempt would pile up, so errors remove it here.
        match self.pull_into(&staging, tarball_url).await {
            Ok(chart_path) => Ok(chart_path),
            Err(err) => {
                remove_staging(&staging).await;
                Err(err)
            }
        }
    }

    async fn install(
        &self,
        namespace: &str,
        name: &str,
        chart_path: &Path,
        values: &Map<String, Value>,
    ) -> Result<(), BackendError> {
        let values_path = write_values(chart_path, values).await?;
        let chart_arg = chart_path.display().to_string();
        let values_arg = values_path.display().to_string();

        self.run(&[
            "install",
            name,
            &chart_arg,
            "-n",
            namespace,
            "--create-namespace",
            "-f",
            &values_arg,
        ])
        .await
        .map(|_| ())
        .map_err(classify_apply_failure)
    }

    async fn upgrade(
        &self,
        namespace: &str,
        name: &str,
        chart_path: &Path,
        values: &Map<String, Value>,
    ) -> Result<(), BackendError> {
        let values_path = write_values(chart_path, values).await?;
        let chart_arg = chart_path.display().to_string();
        let values_arg = values_path.display().to_string();

        self.run(&[
            "upgrade", name, &chart_arg, "-n", namespace, "-f", &values_arg,
        ])
        .await
        .map(|_| ())
        .map_err(classify_apply_failure)
    }

    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        match self.run(&["uninstall", name, "-n", namespace]).await {
            Ok(_) => Ok(()),
            Err(failure) if is_release_not_found(failure.stderr()) => {
                Err(BackendError::ReleaseNotFound)
            }
            Err(failure) => Err(failure.into_other()),
        }
    }

    async fn rollback(
        &self,
        namespace: &str,
        name: &str,
        revision: i64,
    ) -> Result<(), BackendError> {
        let revision_arg = revision.to_string();
        self.run(&["rollback", name, &revision_arg, "-n", namespace])
            .await
            .map(|_| ())
            .map_err(HelmFailure::into_other)
    }
}

/// Values are staged next to the chart archive; both are removed together
/// when the applier cleans up.
async fn write_values(
    chart_path: &Path,
    values: &Map<String, Value>,
) -> Result<PathBuf, BackendError> {
    let values_path = chart_path.with_file_name("values.json");
    let payload =
        serde_json::to_vec(values).map_err(|err| BackendError::Other(err.to_string()))?;
    tokio::fs::write(&values_path, payload)
        .await
        .map_err(|err| BackendError::Other(err.to_string()))?;
    Ok(values_path)
}

fn classify_apply_failure(failure: HelmFailure) -> BackendError {
    let stderr = failure.stderr();
    if is_release_not_found(stderr) {
        BackendError::ReleaseNotFound
    } else if stderr.contains("values don't meet the specifications")
        || stderr.contains("validation failed")
    {
        BackendError::ValidationFailed(stderr.trim().to_string())
    } else if stderr.contains("unable to build kubernetes objects")
        || stderr.contains("error parsing")
    {
        BackendError::InvalidManifest(stderr.trim().to_string())
    } else {
        failure.into_other()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_failures_classify_by_stderr() {
        let validation = classify_apply_failure(HelmFailure::Command(
            "Error: values don't meet the specifications of the schema(s)".to_string(),
        ));
        assert!(matches!(validation, BackendError::ValidationFailed(_)));

        let manifest = classify_apply_failure(HelmFailure::Command(
            "Error: unable to build kubernetes objects from release manifest".to_string(),
        ));
        assert!(matches!(manifest, BackendError::InvalidManifest(_)));

        let missing = classify_apply_failure(HelmFailure::Command(
            "Error: release: not found".to_string(),
        ));
        assert!(matches!(missing, BackendError::ReleaseNotFound));

        let other =
            classify_apply_failure(HelmFailure::Command("Error: connection refused".to_string()));
        assert!(matches!(other, BackendError::Other(_)));
    }

    #[test]
    fn last_deployed_parses_rfc3339() {
        let parsed = parse_last_deployed(Some("2025-11-02T10:00:00Z"));
        assert!(parsed.is_some());
        assert!(parse_last_deployed(Some("yesterday")).is_none());
        assert!(parse_last_deployed(None).is_none());
    }

    fn backend_with_root(bin: &str, root: &Path) -> HelmBackend {
        HelmBackend {
            bin: bin.to_string(),
            fetch_timeout: Duration::from_secs(5),
            staging_root: root.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn failed_fetch_removes_the_staging_directory() {
        let root = tempfile::tempdir().unwrap();
        let backend = backend_with_root("/nonexistent/helm", root.path());

        let err = backend
            .fetch_chart("https://charts.test/app-1.0.0.tgz")
            .await
            .unwrap_err();

        assert!(err.is_fetch_error());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_staging_after_pull_is_removed() {
        // "true" exits zero without writing an archive, so the fetch fails
        // on the empty staging directory.
        let root = tempfile::tempdir().unwrap();
        let backend = backend_with_root("true", root.path());

        let err = backend
            .fetch_chart("https://charts.test/app-1.0.0.tgz")
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::FetchFailed { ref message, .. }
            if message.contains("no chart archive")));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
