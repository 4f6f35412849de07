//! Current state resolution.

use chartkeeper_crd::{ChartRelease, annotation};
use kube::Resource;
use tracing::debug;

use super::{ReleaseResource, ReleaseState};
use crate::Result;
use crate::backend::BackendError;

impl ReleaseResource {
    /// Queries the backend for the release named by the resource. A missing
    /// release is valid "no state" and resolves to the empty value; any
    /// other backend error is fatal.
    ///
    /// The checksum comes from the resource annotation rather than the
    /// backend values: the applier persists it at dispatch time, so a pass
    /// that races a still-running install already sees "attempted".
    pub(super) async fn get_current_state(&self, cr: &ChartRelease) -> Result<ReleaseState> {
        let name = &cr.spec.release_name;

        let content = match self.backend.inspect(&cr.spec.namespace, name).await {
            Ok(content) => content,
            Err(BackendError::ReleaseNotFound) => {
                debug!(release = %name, "release is not installed");
                return Ok(ReleaseState::default());
            }
            Err(err) => return Err(err.into()),
        };

        Ok(ReleaseState {
            name: name.clone(),
            status: Some(content.status),
            values: content.values,
            values_checksum: annotation::values_checksum(cr.meta())
                .unwrap_or_default()
                .to_string(),
            version: content.version,
        })
    }
}
