//! Task registry operations.
//!
//! A task is identified within its session by a caller-supplied dedupe key.
//! Writes are upserts: `INSERT … ON CONFLICT (session_id, dedupe_key) DO UPDATE`
//! lets PostgreSQL resolve racing inserts into updates, so two rows with the
//! same key cannot exist regardless of how many handlers race.
//!
//! Merge rules (last write wins per field): `state` and `title` are replaced
//! only when supplied; `payload` keys are merged at the top level.
//!
//! Every write holds a share lock on the session row, so a concurrent close
//! either waits for it or refuses it.

use anyhow::Result;
use uuid::Uuid;

use super::{is_retryable, lock_open_session, Database, TaskRow, TaskUpsert};

const UPSERT_SQL: &str = "INSERT INTO tasks (session_id, dedupe_key, state, title, payload)
     VALUES ($1, $2, COALESCE($3, 'planned'), $4, COALESCE($5, '{}'::jsonb))
     ON CONFLICT (session_id, dedupe_key) DO UPDATE SET
       state = COALESCE($3, tasks.state),
       title = COALESCE($4, tasks.title),
       payload = tasks.payload || COALESCE($5, '{}'::jsonb),
       updated_at = now()
     RETURNING id, session_id, dedupe_key, state, title, payload, created_at, updated_at";

impl Database {
    /// Upsert a single task.
    pub async fn upsert_task(&self, session_id: Uuid, task: &TaskUpsert) -> Result<TaskRow> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let row = sqlx::query_as::<_, TaskRow>(UPSERT_SQL)
            .bind(session_id)
            .bind(&task.dedupe_key)
            .bind(task.state.map(|s| s.as_str()))
            .bind(task.title.as_deref())
            .bind(task.payload.as_ref())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Upsert a batch of tasks atomically.
    ///
    /// Rows are written in dedupe-key order so concurrent batches touching the
    /// same keys lock them in the same order; repeated keys keep their request
    /// order, so the later entry wins. Deadlock and serialization failures
    /// retry the whole batch. Returned rows follow request order.
    pub async fn upsert_tasks(
        &self,
        session_id: Uuid,
        tasks: &[TaskUpsert],
    ) -> Result<Vec<TaskRow>> {
        const ATTEMPTS: usize = 3;
        let mut order: Vec<usize> = (0..tasks.len()).collect();
        order.sort_by(|&a, &b| tasks[a].dedupe_key.cmp(&tasks[b].dedupe_key));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.upsert_tasks_once(session_id, tasks, &order).await {
                Ok(rows) => return Ok(rows),
                Err(e) if attempt < ATTEMPTS && is_retryable(&e) => {
                    tracing::warn!(attempt, error = %e, "retrying task batch upsert");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upsert_tasks_once(
        &self,
        session_id: Uuid,
        tasks: &[TaskUpsert],
        order: &[usize],
    ) -> Result<Vec<TaskRow>> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let mut rows: Vec<Option<TaskRow>> = vec![None; tasks.len()];
        for &i in order {
            let task = &tasks[i];
            let row = sqlx::query_as::<_, TaskRow>(UPSERT_SQL)
                .bind(session_id)
                .bind(&task.dedupe_key)
                .bind(task.state.map(|s| s.as_str()))
                .bind(task.title.as_deref())
                .bind(task.payload.as_ref())
                .fetch_one(&mut *tx)
                .await?;
            rows[i] = Some(row);
        }
        tx.commit().await?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// All tasks of a session in creation order.
    pub async fn list_tasks(&self, session_id: Uuid) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, session_id, dedupe_key, state, title, payload, created_at, updated_at
             FROM tasks WHERE session_id = $1
             ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
