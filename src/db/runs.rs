//! Run recorder operations: test runs, coverage runs, security checks.
//!
//! All three tables are append-only. "Latest" means greatest `recorded_at`,
//! ties broken by greatest `id`; each table carries a
//! `(session_id, recorded_at DESC, id DESC)` index so the lookup reads a single
//! index entry.
//!
//! Inserts run in a transaction holding a share lock on the session row, so
//! no run can land after the session closes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    lock_open_session, CoverageRunRow, Database, GateSnapshot, SecurityCheckRow,
    SecurityStatus, TestRunRow,
};

impl Database {
    // ── Test runs ─────────────────────────────────────────────────

    pub async fn insert_test_run(
        &self,
        session_id: Uuid,
        passed: bool,
        metadata: &Value,
        recorded_at: Option<DateTime<Utc>>,
    ) -> Result<TestRunRow> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let row = sqlx::query_as::<_, TestRunRow>(
            "INSERT INTO test_runs (session_id, passed, metadata, recorded_at)
             VALUES ($1, $2, $3, COALESCE($4, now()))
             RETURNING id, session_id, passed, metadata, recorded_at",
        )
        .bind(session_id)
        .bind(passed)
        .bind(metadata)
        .bind(recorded_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn latest_test_run(&self, session_id: Uuid) -> Result<Option<TestRunRow>> {
        let row = sqlx::query_as::<_, TestRunRow>(
            "SELECT id, session_id, passed, metadata, recorded_at
             FROM test_runs WHERE session_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Coverage runs ─────────────────────────────────────────────

    pub async fn insert_coverage_run(
        &self,
        session_id: Uuid,
        percent: f64,
        metadata: &Value,
        recorded_at: Option<DateTime<Utc>>,
    ) -> Result<CoverageRunRow> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let row = sqlx::query_as::<_, CoverageRunRow>(
            "INSERT INTO coverage_runs (session_id, percent, metadata, recorded_at)
             VALUES ($1, $2, $3, COALESCE($4, now()))
             RETURNING id, session_id, percent, metadata, recorded_at",
        )
        .bind(session_id)
        .bind(percent)
        .bind(metadata)
        .bind(recorded_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn latest_coverage_run(&self, session_id: Uuid) -> Result<Option<CoverageRunRow>> {
        let row = sqlx::query_as::<_, CoverageRunRow>(
            "SELECT id, session_id, percent, metadata, recorded_at
             FROM coverage_runs WHERE session_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Security checks ───────────────────────────────────────────

    pub async fn insert_security_check(
        &self,
        session_id: Uuid,
        status: SecurityStatus,
        metadata: &Value,
        recorded_at: Option<DateTime<Utc>>,
    ) -> Result<SecurityCheckRow> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let row = sqlx::query_as::<_, SecurityCheckRow>(
            "INSERT INTO security_checks (session_id, status, metadata, recorded_at)
             VALUES ($1, $2, $3, COALESCE($4, now()))
             RETURNING id, session_id, status, metadata, recorded_at",
        )
        .bind(session_id)
        .bind(status.as_str())
        .bind(metadata)
        .bind(recorded_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn latest_security_check(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SecurityCheckRow>> {
        let row = sqlx::query_as::<_, SecurityCheckRow>(
            "SELECT id, session_id, status, metadata, recorded_at
             FROM security_checks WHERE session_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Gate snapshot ─────────────────────────────────────────────

    /// Read task state counts and the three latest runs from one consistent
    /// snapshot (repeatable read, read only).
    pub async fn gate_snapshot(&self, session_id: Uuid) -> Result<GateSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let task_counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM tasks WHERE session_id = $1
             GROUP BY state ORDER BY state",
        )
        .bind(session_id)
        .fetch_all(&mut *tx)
        .await?;

        let latest_test = sqlx::query_as::<_, TestRunRow>(
            "SELECT id, session_id, passed, metadata, recorded_at
             FROM test_runs WHERE session_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let latest_coverage = sqlx::query_as::<_, CoverageRunRow>(
            "SELECT id, session_id, percent, metadata, recorded_at
             FROM coverage_runs WHERE session_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let latest_security = sqlx::query_as::<_, SecurityCheckRow>(
            "SELECT id, session_id, status, metadata, recorded_at
             FROM security_checks WHERE session_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(GateSnapshot {
            task_counts,
            latest_test,
            latest_coverage,
            latest_security,
        })
    }
}
