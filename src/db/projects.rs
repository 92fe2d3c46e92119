//! Project, session, and iteration operations.
//!
//! Projects own sessions; sessions own tasks, runs, and artifacts. A session is
//! `open` until closed, and `closed` is terminal. Iterations number a session's
//! work passes (1, 2, …) and namespace its artifacts.

use anyhow::Result;
use uuid::Uuid;

use super::{
    is_retryable, is_unique_violation, lock_open_session, Database, IterationRow, ProjectRow,
    SessionRow, Transition,
};

impl Database {
    pub async fn create_project(&self, name: &str) -> Result<ProjectRow> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "INSERT INTO projects (name) VALUES ($1)
             RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Option<ProjectRow>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, created_at FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn create_session(&self, project_id: Uuid) -> Result<SessionRow> {
        let row = sqlx::query_as::<_, SessionRow>(
            "INSERT INTO sessions (project_id) VALUES ($1)
             RETURNING id, project_id, status, created_at, closed_at",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, project_id, status, created_at, closed_at
             FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Sessions of a project, oldest first.
    pub async fn list_sessions(&self, project_id: Uuid) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, project_id, status, created_at, closed_at
             FROM sessions WHERE project_id = $1
             ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Close a session. Only the call that moves it from `open` to `closed`
    /// reports `changed`; later calls return the row with its original
    /// `closed_at`. `None` when no such session exists.
    ///
    /// The conditional `UPDATE` takes a row lock that waits out writers holding
    /// the session's share lock, and racing closers re-check `status` after the
    /// winner commits.
    pub async fn close_session(&self, id: Uuid) -> Result<Option<Transition<SessionRow>>> {
        let closed = sqlx::query_as::<_, SessionRow>(
            "UPDATE sessions
             SET status = 'closed', closed_at = now()
             WHERE id = $1 AND status = 'open'
             RETURNING id, project_id, status, created_at, closed_at",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = closed {
            return Ok(Some(Transition { row, changed: true }));
        }
        Ok(self
            .get_session(id)
            .await?
            .map(|row| Transition { row, changed: false }))
    }

    /// Open the next iteration of a session (`max(ordinal) + 1`, starting at 1).
    ///
    /// Two concurrent callers may compute the same ordinal; the loser hits the
    /// `(session_id, ordinal)` unique constraint and retries with a fresh max.
    pub async fn open_iteration(&self, session_id: Uuid) -> Result<IterationRow> {
        const ATTEMPTS: usize = 5;
        let mut last_err = None;
        for _ in 0..ATTEMPTS {
            match self.open_iteration_once(session_id).await {
                Ok(row) => return Ok(row),
                Err(e) if is_unique_violation(&e) || is_retryable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("failed to open iteration")))
    }

    async fn open_iteration_once(&self, session_id: Uuid) -> Result<IterationRow> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let row = sqlx::query_as::<_, IterationRow>(
            "INSERT INTO iterations (session_id, ordinal)
             SELECT $1, COALESCE(MAX(ordinal), 0) + 1 FROM iterations WHERE session_id = $1
             RETURNING id, session_id, ordinal, created_at",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn list_iterations(&self, session_id: Uuid) -> Result<Vec<IterationRow>> {
        let rows = sqlx::query_as::<_, IterationRow>(
            "SELECT id, session_id, ordinal, created_at
             FROM iterations WHERE session_id = $1
             ORDER BY ordinal",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Highest opened iteration ordinal, or 0 when none has been opened.
    pub async fn max_iteration(&self, session_id: Uuid) -> Result<i32> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(ordinal) FROM iterations WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }
}
