//! # Database: PostgreSQL Storage Layer
//!
//! Async access to the control plane's durable state via `sqlx::PgPool`. The
//! relational store is the single source of truth shared by every handler
//! instance; nothing here caches rows in process memory.
//!
//! ## Schema
//!
//! - `projects` → `sessions` → `iterations`: the scoping hierarchy
//! - `tasks`: one row per (session, dedupe key), upserted, never deleted
//! - `test_runs`, `coverage_runs`, `security_checks`: append-only run history
//! - `artifacts`: presigned object records with ownership and status
//! - `audit_log`: append-only redacted mutation records
//!
//! ## Module Structure
//!
//! - [`projects`]: projects, sessions, iterations
//! - [`tasks`]: task upsert and listing
//! - [`runs`]: run recording, latest-row reads, gate snapshots
//! - [`artifacts`]: artifact records for the presign broker
//! - [`audit`]: audit log appends and reads

mod artifacts;
mod audit;
mod projects;
mod runs;
mod tasks;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use uuid::Uuid;

/// Bundled schema, applied by `gatehouse migrate` and the test harness.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/001_control_plane.sql");

// ── Hierarchy types ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SessionRow {
    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct IterationRow {
    pub id: i64,
    pub session_id: Uuid,
    pub ordinal: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of an idempotent transition such as closing a session: the row as
/// it now stands, and whether this call made the change.
#[derive(Debug, Clone)]
pub struct Transition<T> {
    pub row: T,
    pub changed: bool,
}

/// A write the store refused because of the current state of its target.
#[derive(Debug, thiserror::Error)]
pub enum WriteRefused {
    #[error("session {0} not found")]
    SessionMissing(Uuid),
    #[error("session {0} is closed")]
    SessionClosed(Uuid),
    #[error("artifact {0} is already finalized")]
    ArtifactFinalized(String),
}

// ── Task types ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Planned,
    Doing,
    Blocked,
    Done,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Planned => "planned",
            TaskState::Doing => "doing",
            TaskState::Blocked => "blocked",
            TaskState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<TaskState> {
        match s {
            "planned" => Some(TaskState::Planned),
            "doing" => Some(TaskState::Doing),
            "blocked" => Some(TaskState::Blocked),
            "done" => Some(TaskState::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: i64,
    pub session_id: Uuid,
    pub dedupe_key: String,
    pub state: String,
    pub title: Option<String>,
    pub payload: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Incoming fields for one task upsert. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpsert {
    pub dedupe_key: String,
    pub state: Option<TaskState>,
    pub title: Option<String>,
    pub payload: Option<Value>,
}

// ── Run types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRow {
    pub id: i64,
    pub session_id: Uuid,
    pub passed: bool,
    pub metadata: Value,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CoverageRunRow {
    pub id: i64,
    pub session_id: Uuid,
    pub percent: f64,
    pub metadata: Value,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityStatus {
    Pass,
    Fail,
}

impl SecurityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityStatus::Pass => "pass",
            SecurityStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SecurityCheckRow {
    pub id: i64,
    pub session_id: Uuid,
    pub status: String,
    pub metadata: Value,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Everything the gate evaluator reads, captured in one snapshot.
#[derive(Debug, Clone, Default)]
pub struct GateSnapshot {
    /// (state, count) pairs for the session's tasks.
    pub task_counts: Vec<(String, i64)>,
    pub latest_test: Option<TestRunRow>,
    pub latest_coverage: Option<CoverageRunRow>,
    pub latest_security: Option<SecurityCheckRow>,
}

// ── Artifact and audit types ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub iteration: i32,
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ArtifactRow {
    pub fn is_complete(&self) -> bool {
        self.status == "complete"
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRow {
    pub id: i64,
    pub actor_fingerprint: String,
    pub action: String,
    pub target_entity: String,
    pub payload: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Parses the URL by hand so percent-encoded usernames and passwords
    /// (pooler-style `user.tenant` names included) reach the server intact.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    ///
    /// Used by the `/readyz` readiness probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

/// Share-lock the session row for the rest of the caller's transaction and
/// refuse the write unless the session is open.
///
/// Closing takes a conflicting row lock, so a close waits for in-flight writers
/// to commit, and a writer that queues behind a committed close sees `closed`.
pub(crate) async fn lock_open_session(conn: &mut PgConnection, session_id: Uuid) -> Result<()> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM sessions WHERE id = $1 FOR SHARE")
            .bind(session_id)
            .fetch_optional(&mut *conn)
            .await?;
    match status.as_deref() {
        None => Err(WriteRefused::SessionMissing(session_id).into()),
        Some("closed") => Err(WriteRefused::SessionClosed(session_id).into()),
        Some(_) => Ok(()),
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505")
    )
}

/// Postgres error codes worth retrying a whole transaction for:
/// serialization_failure and deadlock_detected.
pub(crate) fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| match e {
            sqlx::Error::Database(db) => db.code().map(|c| c == "40001" || c == "40P01"),
            _ => None,
        })
        .unwrap_or(false)
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips_through_str() {
        for state in [
            TaskState::Planned,
            TaskState::Doing,
            TaskState::Blocked,
            TaskState::Done,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("DONE"), None);
        assert_eq!(TaskState::parse("cancelled"), None);
    }

    #[test]
    fn task_state_serde_uses_lowercase() {
        let s: TaskState = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(s, TaskState::Blocked);
        assert!(serde_json::from_str::<TaskState>("\"Blocked\"").is_err());
    }

    #[test]
    fn schema_declares_task_uniqueness() {
        assert!(SCHEMA_SQL.contains("UNIQUE (session_id, dedupe_key)"));
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS audit_log"));
    }

    #[test]
    fn plain_errors_are_not_retryable() {
        assert!(!is_retryable(&anyhow::anyhow!("nope")));
        assert!(!is_retryable(&anyhow::Error::from(sqlx::Error::RowNotFound)));
    }
}
