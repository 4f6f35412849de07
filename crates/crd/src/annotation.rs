// Copyright 2025 Chartkeeper Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Annotation contract shared with the resource-store schema.
//!
//! The keys below are stable strings; external controllers and operators
//! write a subset of them (cordon, force-upgrade, webhook) while the
//! reconciler owns the checksum and rollback counter.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::chrono::{DateTime, Utc};

/// Checksum of the merged release values last handed to the backend
pub const VALUES_CHECKSUM: &str = "chartkeeper.dev/values-checksum";
/// Number of rollbacks issued while the release has been stuck
pub const ROLLBACK_COUNT: &str = "chartkeeper.dev/rollback-count";
/// RFC 3339 timestamp until which the resource is cordoned
pub const CORDON_UNTIL: &str = "chartkeeper.dev/cordon-until";
/// Operator-supplied reason for the cordon
pub const CORDON_REASON: &str = "chartkeeper.dev/cordon-reason";
/// Opt-in flag for rollback/recreate recovery of stuck releases
pub const FORCE_UPGRADE: &str = "chartkeeper.dev/force-upgrade";
/// Target URL for status change notifications
pub const WEBHOOK_URL: &str = "chartkeeper.dev/webhook-url";
/// Bearer token included in webhook payloads
pub const WEBHOOK_TOKEN: &str = "chartkeeper.dev/webhook-token";

fn get<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Returns the recorded values checksum, if any.
#[must_use]
pub fn values_checksum(meta: &ObjectMeta) -> Option<&str> {
    get(meta, VALUES_CHECKSUM)
}

/// Returns the rollback counter. Absent or malformed annotations count as
/// zero so a mangled annotation cannot wedge recovery.
#[must_use]
pub fn rollback_count(meta: &ObjectMeta) -> u32 {
    get(meta, ROLLBACK_COUNT)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// Returns the cordon expiry timestamp when present and well-formed.
#[must_use]
pub fn cordoned_until(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    get(meta, CORDON_UNTIL)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Returns true while the cordon window is open. The annotation is never
/// actively cleared; it expires by the clock moving past it.
#[must_use]
pub fn is_cordoned(meta: &ObjectMeta) -> bool {
    cordoned_until(meta).is_some_and(|until| until > Utc::now())
}

/// Returns the operator-supplied cordon reason.
#[must_use]
pub fn cordon_reason(meta: &ObjectMeta) -> Option<&str> {
    get(meta, CORDON_REASON)
}

/// Returns true when the resource opts in to stuck-release recovery.
#[must_use]
pub fn has_force_upgrade(meta: &ObjectMeta) -> bool {
    get(meta, FORCE_UPGRADE).is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

/// Returns the webhook target URL, if configured.
#[must_use]
pub fn webhook_url(meta: &ObjectMeta) -> Option<&str> {
    get(meta, WEBHOOK_URL)
}

/// Returns the webhook token, if configured.
#[must_use]
pub fn webhook_token(meta: &ObjectMeta) -> Option<&str> {
    get(meta, WEBHOOK_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::chrono::Duration;
    use std::collections::BTreeMap;

    fn meta_with(entries: &[(&str, &str)]) -> ObjectMeta {
        let annotations: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ObjectMeta {
            annotations: Some(annotations),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn rollback_count_defaults_to_zero() {
        assert_eq!(rollback_count(&ObjectMeta::default()), 0);
        assert_eq!(rollback_count(&meta_with(&[(ROLLBACK_COUNT, "bogus")])), 0);
    }

    #[test]
    fn rollback_count_parses_value() {
        assert_eq!(rollback_count(&meta_with(&[(ROLLBACK_COUNT, "2")])), 2);
        assert_eq!(rollback_count(&meta_with(&[(ROLLBACK_COUNT, " 7 ")])), 7);
    }

    #[test]
    fn cordon_expires_with_the_clock() {
        let future = (Utc::now() + Duration::hours(1)).to_rfc3339();
        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();

        assert!(is_cordoned(&meta_with(&[(CORDON_UNTIL, &future)])));
        assert!(!is_cordoned(&meta_with(&[(CORDON_UNTIL, &past)])));
        assert!(!is_cordoned(&meta_with(&[(CORDON_UNTIL, "not-a-time")])));
        assert!(!is_cordoned(&ObjectMeta::default()));
    }

    #[test]
    fn force_upgrade_requires_true() {
        assert!(has_force_upgrade(&meta_with(&[(FORCE_UPGRADE, "true")])));
        assert!(has_force_upgrade(&meta_with(&[(FORCE_UPGRADE, "True")])));
        assert!(!has_force_upgrade(&meta_with(&[(FORCE_UPGRADE, "1")])));
        assert!(!has_force_upgrade(&ObjectMeta::default()));
    }

    #[test]
    fn webhook_accessors() {
        let meta = meta_with(&[
            (WEBHOOK_URL, "https://example.test/hook"),
            (WEBHOOK_TOKEN, "s3cret"),
        ]);
        assert_eq!(webhook_url(&meta), Some("https://example.test/hook"));
        assert_eq!(webhook_token(&meta), Some("s3cret"));
        assert_eq!(webhook_url(&ObjectMeta::default()), None);
    }
}
