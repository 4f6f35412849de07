//! Release reconciliation: state resolution, change planning, bounded
//! change application, and stuck-release recovery.

use std::sync::Arc;

use chartkeeper_crd::ChartRelease;
use tracing::{debug, instrument};

use crate::backend::ReleaseBackend;
use crate::pass::PassOutcome;
use crate::store::ResourceStore;
use crate::{Result, Settings};

mod apply;
mod current;
mod desired;
pub mod plan;
mod rollback;
pub mod state;

pub use rollback::RollbackDecision;
pub use state::{ReleaseState, ReleaseStatus};

/// Reconciles one release against its declared state.
pub struct ReleaseResource {
    backend: Arc<dyn ReleaseBackend>,
    store: Arc<dyn ResourceStore>,
    settings: Settings,
}

impl ReleaseResource {
    /// Builds the resource from its collaborators.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ReleaseBackend>,
        store: Arc<dyn ResourceStore>,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            store,
            settings,
        }
    }

    /// Runs the release step of a non-delete pass: resolve state, recover a
    /// stuck release if needed, plan, and apply the planned branch.
    #[instrument(skip(self, cr), fields(release = %cr.spec.release_name))]
    pub async fn ensure(&self, cr: &ChartRelease) -> Result<PassOutcome> {
        let current = self.get_current_state(cr).await?;
        let desired = self.get_desired_state(cr).await?;

        if current.status.is_some_and(ReleaseStatus::is_transitional) {
            return self.recover_stuck(cr, &current).await;
        }
        self.clear_rollback_count(cr).await?;

        let patch = plan::update_patch(&current, &desired);
        if let Some(create) = patch.create {
            return self.apply_create(cr, &create).await;
        }
        if let Some(update) = patch.update {
            return self.apply_update(cr, &update).await;
        }

        debug!("release already converged");
        Ok(PassOutcome::done())
    }

    /// Runs the release step of a delete pass.
    #[instrument(skip(self, cr), fields(release = %cr.spec.release_name))]
    pub async fn cleanup(&self, cr: &ChartRelease) -> Result<PassOutcome> {
        let current = self.get_current_state(cr).await?;
        let desired = self.get_desired_state(cr).await?;

        let patch = plan::delete_patch(&current, &desired);
        if let Some(delete) = patch.delete {
            return self.apply_delete(cr, &delete).await;
        }

        debug!("nothing to delete");
        Ok(PassOutcome::done())
    }
}
