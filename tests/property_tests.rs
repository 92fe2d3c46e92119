//! Property-based tests for gatehouse's pure policy functions.
//!
//! These tests use the `proptest` framework to check invariants that must hold
//! for every input rather than a handful of examples: a sanitized filename can
//! never escape its session prefix, redaction never leaks a denylisted value,
//! the overall gate is exactly the conjunction of the four gates, and the
//! sliding window never admits more than its limit.
//!
//! # Prerequisites
//!
//! - No database or network access required.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//!
//! # Increase case count for thorough testing (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use chrono::Utc;
use gatehouse::artifacts::{object_key, sanitize_filename, session_prefix};
use gatehouse::audit::{Redactor, REDACTED};
use gatehouse::db::{CoverageRunRow, GateSnapshot, SecurityCheckRow, TestRunRow};
use gatehouse::gates::{evaluate, GatePolicy};
use gatehouse::rate_limit::RateLimiter;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use uuid::Uuid;

// == Artifact keys =============================================================

proptest! {
    /// Any filename, however hostile, reduces to one safe path component.
    #[test]
    fn prop_sanitize_filename_single_component(name in any::<String>()) {
        let clean = sanitize_filename(&name);
        prop_assert!(!clean.is_empty());
        prop_assert!(clean.len() <= 128);
        prop_assert!(!clean.contains('/'));
        prop_assert!(!clean.contains('\\'));
        prop_assert!(!clean.contains(".."));
        prop_assert!(!clean.starts_with('.'));
        prop_assert!(clean
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-'));
    }

    /// Traversal-shaped names built from path fragments stay under the prefix.
    #[test]
    fn prop_object_key_stays_under_prefix(
        parts in prop::collection::vec(
            prop_oneof![
                Just("..".to_string()),
                Just(".".to_string()),
                Just("".to_string()),
                "[a-zA-Z0-9 _.-]{1,12}",
            ],
            1..8,
        ),
        sep in prop_oneof![Just("/"), Just("\\")],
        iteration in 1i32..1000,
    ) {
        let (p, s) = (Uuid::new_v4(), Uuid::new_v4());
        let name = parts.join(sep);
        let key = object_key(p, s, iteration, &sanitize_filename(&name));
        let prefix = format!("{}iterations/{}/", session_prefix(p, s), iteration);
        prop_assert!(key.starts_with(&prefix));
        let tail = &key[prefix.len()..];
        prop_assert!(!tail.contains('/'));
        prop_assert!(tail != "." && tail != "..");
    }

    /// Sanitizing is a fixed point: a clean name passes through unchanged.
    #[test]
    fn prop_sanitize_filename_idempotent(name in any::<String>()) {
        let once = sanitize_filename(&name);
        prop_assert_eq!(sanitize_filename(&once), once);
    }
}

// == Redaction =================================================================

fn sensitive_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("password".to_string()),
        Just("api_key".to_string()),
        Just("X-Api-Key".to_string()),
        Just("githubToken".to_string()),
        Just("Authorization".to_string()),
        Just("client_secret".to_string()),
        Just("AWS_SECRET_ACCESS_KEY".to_string()),
    ]
}

/// Wrap `leaf` in a chain of objects and arrays following `path`.
fn nest(path: &[(String, bool)], leaf: Value) -> Value {
    path.iter().rev().fold(leaf, |inner, (key, in_array)| {
        let inner = if *in_array { json!([1, inner, "x"]) } else { inner };
        let mut map = Map::new();
        map.insert(key.clone(), inner);
        map.insert("note".to_string(), json!("kept"));
        Value::Object(map)
    })
}

proptest! {
    /// A denylisted key at any depth never reaches the audit payload.
    #[test]
    fn prop_redact_hides_sensitive_values(
        path in prop::collection::vec(("f[a-z]{0,6}x", any::<bool>()), 0..6),
        key in sensitive_key(),
        secret in "[A-Za-z0-9]{12,32}",
    ) {
        let mut leaf = Map::new();
        leaf.insert(key.clone(), json!(secret.clone()));
        leaf.insert("count".to_string(), json!(3));
        let payload = nest(&path, Value::Object(leaf));

        let redacted = Redactor::default().redact(&payload);
        let text = redacted.to_string();
        prop_assert!(!text.contains(&secret));
        prop_assert!(text.contains(REDACTED));
        // Non-sensitive siblings survive.
        prop_assert!(text.contains("\"count\":3"));
    }

    /// Redaction is idempotent.
    #[test]
    fn prop_redact_idempotent(
        path in prop::collection::vec(("f[a-z]{0,6}x", any::<bool>()), 0..4),
        key in sensitive_key(),
    ) {
        let mut leaf = Map::new();
        leaf.insert(key, json!("value"));
        let payload = nest(&path, Value::Object(leaf));
        let redactor = Redactor::default();
        let once = redactor.redact(&payload);
        prop_assert_eq!(redactor.redact(&once), once);
    }
}

// == Gates =====================================================================

fn snapshot(
    counts: &[i64; 4],
    test: Option<bool>,
    coverage: Option<f64>,
    security: Option<bool>,
) -> GateSnapshot {
    let now = Utc::now();
    let session_id = Uuid::new_v4();
    GateSnapshot {
        task_counts: ["blocked", "doing", "done", "planned"]
            .iter()
            .zip(counts)
            .filter(|(_, n)| **n > 0)
            .map(|(state, n)| (state.to_string(), *n))
            .collect(),
        latest_test: test.map(|passed| TestRunRow {
            id: 1,
            session_id,
            passed,
            metadata: json!({}),
            recorded_at: now,
        }),
        latest_coverage: coverage.map(|percent| CoverageRunRow {
            id: 2,
            session_id,
            percent,
            metadata: json!({}),
            recorded_at: now,
        }),
        latest_security: security.map(|pass| SecurityCheckRow {
            id: 3,
            session_id,
            status: if pass { "pass" } else { "fail" }.to_string(),
            metadata: json!({}),
            recorded_at: now,
        }),
    }
}

proptest! {
    /// `overall` is the conjunction of the four gates and `blocking` lists
    /// exactly the failing ones.
    #[test]
    fn prop_evaluate_overall_is_conjunction(
        counts in prop::array::uniform4(0i64..5),
        test in prop::option::of(any::<bool>()),
        coverage in prop::option::of(0.0f64..=100.0),
        security in prop::option::of(any::<bool>()),
        threshold in 0.0f64..=100.0,
    ) {
        let policy = GatePolicy { min_coverage_percent: threshold };
        let report = evaluate(&snapshot(&counts, test, coverage, security), &policy);

        prop_assert_eq!(
            report.overall,
            report.tasks && report.tests && report.coverage && report.security
        );
        let failing = [report.tasks, report.tests, report.coverage, report.security]
            .iter()
            .filter(|ok| !**ok)
            .count();
        prop_assert_eq!(report.details.blocking.len(), failing);

        // Only `done` tasks may remain for the tasks gate to pass.
        prop_assert_eq!(report.tasks, counts[0] + counts[1] + counts[3] == 0);
        prop_assert_eq!(report.tests, test == Some(true));
        prop_assert_eq!(report.coverage, coverage.is_some_and(|c| c >= threshold));
        prop_assert_eq!(report.security, security != Some(false));
    }

    /// Evaluation is a pure function of its snapshot.
    #[test]
    fn prop_evaluate_deterministic(
        counts in prop::array::uniform4(0i64..5),
        test in prop::option::of(any::<bool>()),
        coverage in prop::option::of(0.0f64..=100.0),
    ) {
        let snap = snapshot(&counts, test, coverage, None);
        let policy = GatePolicy::default();
        prop_assert_eq!(evaluate(&snap, &policy), evaluate(&snap, &policy));
    }
}

// == Rate limiting =============================================================

proptest! {
    /// Within one window a key is admitted exactly `max` times.
    #[test]
    fn prop_rate_limiter_admits_at_most_max(max in 1u32..20, attempts in 1u32..60) {
        let limiter = RateLimiter::new(Duration::from_secs(60), max);
        let start = Instant::now();
        let admitted = (0..attempts)
            .filter(|i| {
                limiter
                    .check_local("key", start + Duration::from_millis(*i as u64))
                    .is_allowed()
            })
            .count() as u32;
        prop_assert_eq!(admitted, attempts.min(max));
        // A different key has its own budget.
        prop_assert!(limiter.check_local("other", start).is_allowed());
    }
}
