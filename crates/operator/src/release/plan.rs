//! Change planning: pure diffing of `(current, desired)` release state.
//!
//! Checksum comparison is authoritative for "has configuration changed";
//! raw value maps are never diffed because merge ordering is not part of
//! the contract.

use tracing::debug;

use super::state::{ReleaseState, ReleaseStatus};

/// The changes one pass may apply. At most one of `create`/`update` is set;
/// `delete` is only planned while the resource is being removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReleasePatch {
    /// Release to install
    pub create: Option<ReleaseState>,
    /// Release to upgrade
    pub update: Option<ReleaseState>,
    /// Release to remove
    pub delete: Option<ReleaseState>,
}

/// Plans the create branch: install when nothing is there yet, or when the
/// existing release belongs to a different name.
#[must_use]
pub fn plan_create(current: &ReleaseState, desired: &ReleaseState) -> Option<ReleaseState> {
    if current.is_empty() || current.name != desired.name {
        debug!(release = %desired.name, "release needs to be created");
        Some(desired.clone())
    } else {
        debug!(release = %desired.name, "release does not need to be created");
        None
    }
}

/// Plans the update branch.
///
/// Skips: absent current (create path), transitional current (rollback
/// recovery owns it), and a failed release whose desired checksum and
/// version are unchanged: replaying a request the backend already rejected
/// converges on nothing, so a spec or status change is required first.
#[must_use]
pub fn plan_update(current: &ReleaseState, desired: &ReleaseState) -> Option<ReleaseState> {
    if current.is_empty() {
        return None;
    }

    if current.status.is_some_and(ReleaseStatus::is_transitional) {
        debug!(
            release = %desired.name,
            status = ?current.status,
            "release is in a transition status and cannot be updated"
        );
        return None;
    }

    if current.status == Some(ReleaseStatus::Failed) && !is_modified(current, desired) {
        debug!(
            release = %desired.name,
            "release is failed and the desired state is unchanged, not retrying"
        );
        return None;
    }

    if is_modified(current, desired) || current.status != desired.status {
        debug!(release = %desired.name, "release has to be updated");
        Some(desired.clone())
    } else {
        debug!(release = %desired.name, "release does not have to be updated");
        None
    }
}

/// Plans the delete branch. Only deletes a release this resource actually
/// owns: a name mismatch (e.g. a rename mid-flight) is left alone.
#[must_use]
pub fn plan_delete(current: &ReleaseState, desired: &ReleaseState) -> Option<ReleaseState> {
    if !current.is_empty() && current.name == desired.name {
        debug!(release = %desired.name, "release needs to be deleted");
        Some(desired.clone())
    } else {
        debug!(release = %desired.name, "release does not need to be deleted");
        None
    }
}

/// Builds the patch for a non-delete pass. Create wins over update so at
/// most one mutating branch runs per pass.
#[must_use]
pub fn update_patch(current: &ReleaseState, desired: &ReleaseState) -> ReleasePatch {
    let create = plan_create(current, desired);
    let update = if create.is_some() {
        None
    } else {
        plan_update(current, desired)
    };

    ReleasePatch {
        create,
        update,
        delete: None,
    }
}

/// Builds the patch for a delete pass.
#[must_use]
pub fn delete_patch(current: &ReleaseState, desired: &ReleaseState) -> ReleasePatch {
    ReleasePatch {
        delete: plan_delete(current, desired),
        ..ReleasePatch::default()
    }
}

fn is_modified(current: &ReleaseState, desired: &ReleaseState) -> bool {
    current.values_checksum != desired.values_checksum || current.version != desired.version
}
