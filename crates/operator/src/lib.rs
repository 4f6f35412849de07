// Copyright 2025 Chartkeeper Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Operator internals

use std::time::Duration;

use crate::backend::BackendError;

/// Generic Error for controller lifecycle
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Kubernetes internal error
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    /// `serde` errors
    #[error("Serialization Error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Release backend errors that are not handled in place
    #[error("Backend Error: {0}")]
    BackendError(#[from] BackendError),

    /// A referenced values source object does not exist
    #[error("{kind} {name:?} in namespace {namespace:?} not found")]
    SourceNotFound {
        /// Source kind, `configmap` or `secret`
        kind: &'static str,
        /// Name of the missing object
        name: String,
        /// Namespace of the missing object
        namespace: String,
    },

    /// Config map and secret values define the same top-level key
    #[error("configmap and secret values share the top-level key {0:?}")]
    ValuesConflict(String),

    /// Outbound webhook errors
    #[error("Webhook Error: {0}")]
    WebhookError(#[from] reqwest::Error),

    /// Generic string error messages
    #[error("{0}")]
    Message(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

/// Generic result type to be used in the controller
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operational knobs for the reconciler, read from the environment.
#[derive(Clone, Debug)]
pub struct Settings {
    /// How long an update dispatch is waited on before the pass is canceled
    pub update_wait: Duration,
    /// Bound on chart tarball downloads
    pub fetch_timeout: Duration,
    /// Rollback budget for stuck releases
    pub max_rollback: u32,
    /// Timeout for status webhook deliveries
    pub webhook_timeout: Duration,
    /// Helm binary used by the shipped backend
    pub helm_bin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            update_wait: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
            max_rollback: 3,
            webhook_timeout: Duration::from_secs(10),
            helm_bin: "helm".to_string(),
        }
    }
}

impl Settings {
    /// Reads settings from `CHARTKEEPER_*` environment variables, falling
    /// back to defaults for anything absent or malformed.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            update_wait: env_secs("CHARTKEEPER_UPDATE_WAIT_SECS").unwrap_or(defaults.update_wait),
            fetch_timeout: env_secs("CHARTKEEPER_FETCH_TIMEOUT_SECS")
                .unwrap_or(defaults.fetch_timeout),
            max_rollback: std::env::var("CHARTKEEPER_MAX_ROLLBACK")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.max_rollback),
            webhook_timeout: env_secs("CHARTKEEPER_WEBHOOK_TIMEOUT_SECS")
                .unwrap_or(defaults.webhook_timeout),
            helm_bin: std::env::var("CHARTKEEPER_HELM_BIN").unwrap_or(defaults.helm_bin),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
}

pub mod backend;
pub mod controller;
mod diagnostics;
pub mod pass;
pub mod release;
pub mod status;
pub mod store;

pub mod lease;
pub mod telemetry;

pub use crate::controller::{State, run};
pub use crate::diagnostics::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_defaults() {
        temp_env::with_vars_unset(
            ["CHARTKEEPER_UPDATE_WAIT_SECS", "CHARTKEEPER_MAX_ROLLBACK"],
            || {
                let settings = Settings::from_env();
                assert_eq!(settings.update_wait, Duration::from_secs(10));
                assert_eq!(settings.max_rollback, 3);
                assert_eq!(settings.helm_bin, "helm");
            },
        );
    }

    #[test]
    fn settings_read_from_env() {
        temp_env::with_vars(
            [
                ("CHARTKEEPER_UPDATE_WAIT_SECS", Some("42")),
                ("CHARTKEEPER_MAX_ROLLBACK", Some("5")),
                ("CHARTKEEPER_HELM_BIN", Some("/usr/local/bin/helm")),
            ],
            || {
                let settings = Settings::from_env();
                assert_eq!(settings.update_wait, Duration::from_secs(42));
                assert_eq!(settings.max_rollback, 5);
                assert_eq!(settings.helm_bin, "/usr/local/bin/helm");
            },
        );
    }

    #[test]
    fn malformed_env_values_are_ignored() {
        temp_env::with_var("CHARTKEEPER_UPDATE_WAIT_SECS", Some("soon"), || {
            let settings = Settings::from_env();
            assert_eq!(settings.update_wait, Duration::from_secs(10));
        });
    }
}
