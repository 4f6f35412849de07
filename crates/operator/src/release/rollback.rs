//! Stuck-release recovery.
//!
//! A release observed in a transition status at update time is either rolled
//! back (or deleted, when the install never completed) under a bounded
//! budget, or left for an operator once the budget is spent. The budget
//! counter lives in an annotation and is cleared by any pass that observes a
//! stable status.

use chartkeeper_crd::{ChartRelease, annotation};
use kube::Resource;
use tracing::{debug, info, warn};

use super::state::{ReleaseState, ReleaseStatus};
use super::ReleaseResource;
use crate::pass::PassOutcome;
use crate::Result;

/// What to do about a release observed in a transition status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackDecision {
    /// The install never completed; there is nothing to roll back to
    DeletePending,
    /// Restore the previous revision
    RollbackToPrevious,
    /// Budget spent or recovery not opted in; await external intervention
    Exhausted,
    /// The release is not stuck
    NotNeeded,
}

/// Pure decision function over the observed status and the rollback budget.
#[must_use]
pub fn evaluate(
    status: Option<ReleaseStatus>,
    force_upgrade: bool,
    rollback_count: u32,
    max_rollback: u32,
) -> RollbackDecision {
    let Some(status) = status else {
        return RollbackDecision::NotNeeded;
    };
    if !status.is_transitional() {
        return RollbackDecision::NotNeeded;
    }
    if !force_upgrade || rollback_count >= max_rollback {
        return RollbackDecision::Exhausted;
    }
    if status == ReleaseStatus::PendingInstall {
        RollbackDecision::DeletePending
    } else {
        RollbackDecision::RollbackToPrevious
    }
}

impl ReleaseResource {
    /// Recovers a release stuck in a transition status. The pass always ends
    /// with a no-op patch; reconciliation re-evaluates once the backend has
    /// settled.
    pub(super) async fn recover_stuck(
        &self,
        cr: &ChartRelease,
        current: &ReleaseState,
    ) -> Result<PassOutcome> {
        let count = annotation::rollback_count(cr.meta());
        let force_upgrade = annotation::has_force_upgrade(cr.meta());
        let namespace = &cr.spec.namespace;

        match evaluate(current.status, force_upgrade, count, self.settings.max_rollback) {
            RollbackDecision::NotNeeded => Ok(PassOutcome::done()),
            RollbackDecision::Exhausted => {
                warn!(
                    release = %current.name,
                    status = ?current.status,
                    rollback_count = count,
                    max_rollback = self.settings.max_rollback,
                    force_upgrade,
                    "release is stuck, awaiting external intervention"
                );
                Ok(PassOutcome::done())
            }
            RollbackDecision::DeletePending => {
                debug!(release = %current.name, "deleting release stuck in pending-install");
                self.backend.uninstall(namespace, &current.name).await?;
                self.bump_rollback_count(cr, count).await?;
                info!(release = %current.name, "deleted stuck release");
                Ok(PassOutcome::done())
            }
            RollbackDecision::RollbackToPrevious => {
                debug!(
                    release = %current.name,
                    status = ?current.status,
                    "rolling release back to the previous revision"
                );
                self.backend.rollback(namespace, &current.name, 0).await?;
                self.bump_rollback_count(cr, count).await?;
                info!(release = %current.name, "rolled back stuck release");
                Ok(PassOutcome::done())
            }
        }
    }

    /// Clears the rollback counter once the release is observed stable.
    pub(super) async fn clear_rollback_count(&self, cr: &ChartRelease) -> Result<()> {
        if annotation::rollback_count(cr.meta()) == 0 {
            return Ok(());
        }
        self.store
            .annotate(cr, annotation::ROLLBACK_COUNT, None)
            .await
    }

    async fn bump_rollback_count(&self, cr: &ChartRelease, count: u32) -> Result<()> {
        self.store
            .annotate(
                cr,
                annotation::ROLLBACK_COUNT,
                Some((count + 1).to_string()),
            )
            .await
    }
}
