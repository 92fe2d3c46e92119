//! # Gates: Session Readiness Verdicts
//!
//! Four independent boolean gates computed from a [`GateSnapshot`]:
//!
//! | Gate | Passes when | With no history |
//! |------|-------------|-----------------|
//! | `tasks` | no task is planned, doing, or blocked | pass (zero tasks) |
//! | `tests` | latest test run passed | **fail** |
//! | `coverage` | latest coverage ≥ threshold (default 70) | **fail** |
//! | `security` | latest security check is `pass` | **pass** |
//!
//! The security default differs from tests and coverage on purpose: a session
//! that never ran a scanner is not blocked by it.
//!
//! `overall` is the AND of all four. Evaluation is a pure function of the
//! snapshot: nothing is stored and the report carries no clock values, so two
//! evaluations of the same state are identical.

use serde::Serialize;

use crate::db::GateSnapshot;

/// Threshold configuration for evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GatePolicy {
    pub min_coverage_percent: f64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        GatePolicy {
            min_coverage_percent: 70.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDetails {
    pub total_tasks: i64,
    pub open_tasks: i64,
    pub latest_test_run_id: Option<i64>,
    pub latest_test_passed: Option<bool>,
    pub latest_coverage_run_id: Option<i64>,
    pub latest_coverage_percent: Option<f64>,
    pub min_coverage_percent: f64,
    pub latest_security_check_id: Option<i64>,
    pub latest_security_status: Option<String>,
    /// Names of the gates currently failing, in fixed order.
    pub blocking: Vec<&'static str>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub tasks: bool,
    pub tests: bool,
    pub coverage: bool,
    pub security: bool,
    pub overall: bool,
    pub details: GateDetails,
}

/// States that keep the `tasks` gate closed.
const OPEN_STATES: &[&str] = &["planned", "doing", "blocked"];

pub fn evaluate(snapshot: &GateSnapshot, policy: &GatePolicy) -> GateReport {
    let total_tasks: i64 = snapshot.task_counts.iter().map(|(_, n)| *n).sum();
    let open_tasks: i64 = snapshot
        .task_counts
        .iter()
        .filter(|(state, _)| OPEN_STATES.contains(&state.as_str()))
        .map(|(_, n)| *n)
        .sum();

    let tasks = open_tasks == 0;
    let tests = snapshot.latest_test.as_ref().is_some_and(|t| t.passed);
    let coverage = snapshot
        .latest_coverage
        .as_ref()
        .is_some_and(|c| c.percent >= policy.min_coverage_percent);
    let security = snapshot
        .latest_security
        .as_ref()
        .map_or(true, |s| s.status == "pass");

    let blocking: Vec<&'static str> = [
        ("tasks", tasks),
        ("tests", tests),
        ("coverage", coverage),
        ("security", security),
    ]
    .into_iter()
    .filter(|(_, ok)| !ok)
    .map(|(name, _)| name)
    .collect();

    GateReport {
        tasks,
        tests,
        coverage,
        security,
        overall: tasks && tests && coverage && security,
        details: GateDetails {
            total_tasks,
            open_tasks,
            latest_test_run_id: snapshot.latest_test.as_ref().map(|t| t.id),
            latest_test_passed: snapshot.latest_test.as_ref().map(|t| t.passed),
            latest_coverage_run_id: snapshot.latest_coverage.as_ref().map(|c| c.id),
            latest_coverage_percent: snapshot.latest_coverage.as_ref().map(|c| c.percent),
            min_coverage_percent: policy.min_coverage_percent,
            latest_security_check_id: snapshot.latest_security.as_ref().map(|s| s.id),
            latest_security_status: snapshot.latest_security.as_ref().map(|s| s.status.clone()),
            blocking,
        },
    }
}
