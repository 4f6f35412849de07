//! Per-pass result signalling between pipeline steps.
//!
//! Steps return a [`PassOutcome`] instead of mutating a shared context: a
//! canceled pass stops further mutation without being an error, a kept
//! finalizer defers resource removal, and a status override carries a
//! failure reason to the status reporter when the backend cannot.

/// Status reason recorded by a step for the status reporter to persist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusOverride {
    /// Human-readable summary of what went wrong
    pub reason: String,
    /// Release status code to record alongside the reason
    pub status: String,
}

/// Composable result of one pipeline step within a reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// The pass stops here; the next scheduled pass re-resolves state
    pub cancelled: bool,
    /// Do not release the resource finalizer this pass (delete only)
    pub keep_finalizer: bool,
    /// Reason to surface on the status sub-resource instead of a backend query
    pub status_override: Option<StatusOverride>,
}

impl PassOutcome {
    /// The step completed; the pass continues.
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// The step canceled the pass. Not an error; the next pass retries.
    #[must_use]
    pub fn cancel() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    /// Marks the finalizer as kept for this pass.
    #[must_use]
    pub fn keeping_finalizer(mut self) -> Self {
        self.keep_finalizer = true;
        self
    }

    /// Attaches a status reason for the status reporter.
    #[must_use]
    pub fn with_status(mut self, reason: impl Into<String>, status: impl Into<String>) -> Self {
        self.status_override = Some(StatusOverride {
            reason: reason.into(),
            status: status.into(),
        });
        self
    }
}
