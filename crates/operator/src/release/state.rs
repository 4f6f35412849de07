//! Release state value types.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Backend status codes for a release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Install dispatched but not settled
    PendingInstall,
    /// Upgrade dispatched but not settled
    PendingUpgrade,
    /// Rollback dispatched but not settled
    PendingRollback,
    /// The release is running the desired revision
    Deployed,
    /// The backend rejected or lost the latest operation
    Failed,
    /// Replaced by a newer revision
    Superseded,
    /// Removal in progress
    Uninstalling,
    /// Terminal deleted sentinel
    Uninstalled,
    /// Anything the backend reports that we do not model
    #[default]
    Unknown,
}

impl ReleaseStatus {
    /// Parses a backend status code; unmodelled codes map to `Unknown`.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            "deployed" => Self::Deployed,
            "failed" => Self::Failed,
            "superseded" => Self::Superseded,
            "uninstalling" => Self::Uninstalling,
            "uninstalled" => Self::Uninstalled,
            _ => Self::Unknown,
        }
    }

    /// The stable string code, part of the status contract.
    #[must_use]
    pub fn as_code(self) -> &'static str {
        match self {
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
            Self::Uninstalling => "uninstalling",
            Self::Uninstalled => "uninstalled",
            Self::Unknown => "unknown",
        }
    }

    /// True while an install/upgrade/rollback has been dispatched but has
    /// not settled. Transitional releases are never updated in place.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Observed or desired state of one release.
///
/// An empty release name denotes "no state": the release is absent, or the
/// desired state resolves to nothing beyond deletion bookkeeping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReleaseState {
    /// Release name; empty means no state
    pub name: String,
    /// Backend status; `None` when absent
    pub status: Option<ReleaseStatus>,
    /// Merged configuration values
    pub values: Map<String, Value>,
    /// Checksum of the merged values, the authoritative change key
    pub values_checksum: String,
    /// Chart version
    pub version: String,
}

impl ReleaseState {
    /// True when this value denotes "no state".
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// Deterministic digest of merged values. `serde_json` maps are ordered, so
/// serialization is stable regardless of insertion order. Empty values hash
/// to the empty string so "no values" never looks like a change.
pub fn values_checksum(values: &Map<String, Value>) -> Result<String, serde_json::Error> {
    if values.is_empty() {
        return Ok(String::new());
    }
    let payload = serde_json::to_vec(values)?;
    Ok(hex::encode(Sha256::digest(&payload)))
}
