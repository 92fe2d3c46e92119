//! Artifact records for the presign broker.
//!
//! The row, not the storage bucket, is the authority on an artifact's
//! existence, owner, and completion. Rows are written only after a presign
//! succeeds and move `pending → complete` through [`Database::complete_artifact`].
//! Both writes hold the owning session's share lock, so neither can land after
//! the session closes.

use anyhow::Result;
use uuid::Uuid;

use super::{lock_open_session, ArtifactRow, Database, Transition, WriteRefused};

const ARTIFACT_COLUMNS: &str =
    "id, session_id, iteration, key, filename, content_type, status, created_at, completed_at";

impl Database {
    /// Record a freshly presigned upload as `pending`.
    ///
    /// Keys are derived from (project, session, iteration, filename), so a
    /// re-upload of a file that is still `pending` reuses its row. A finalized
    /// key is never reopened: the call fails with
    /// [`WriteRefused::ArtifactFinalized`].
    pub async fn upsert_pending_artifact(
        &self,
        session_id: Uuid,
        iteration: i32,
        key: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<ArtifactRow> {
        let mut tx = self.pool.begin().await?;
        lock_open_session(&mut *tx, session_id).await?;
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            "INSERT INTO artifacts (session_id, iteration, key, filename, content_type)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (key) DO UPDATE SET
               filename = EXCLUDED.filename,
               content_type = EXCLUDED.content_type
             WHERE artifacts.session_id = EXCLUDED.session_id
               AND artifacts.status = 'pending'
             RETURNING {}",
            ARTIFACT_COLUMNS
        ))
        .bind(session_id)
        .bind(iteration)
        .bind(key)
        .bind(filename)
        .bind(content_type)
        .fetch_optional(&mut *tx)
        .await?;
        // Keys embed the session id, so a skipped update means the row is complete.
        let row = row.ok_or_else(|| WriteRefused::ArtifactFinalized(key.to_string()))?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn get_artifact(&self, id: Uuid) -> Result<Option<ArtifactRow>> {
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {} FROM artifacts WHERE id = $1",
            ARTIFACT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Mark an artifact complete. `changed` is set only for the call that made
    /// the `pending → complete` transition; an already-complete artifact comes
    /// back as is, even once its session has closed. `None` when no such
    /// artifact exists.
    pub async fn complete_artifact(&self, id: Uuid) -> Result<Option<Transition<ArtifactRow>>> {
        let select = format!("SELECT {} FROM artifacts WHERE id = $1", ARTIFACT_COLUMNS);
        let mut tx = self.pool.begin().await?;
        let Some(current) = sqlx::query_as::<_, ArtifactRow>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        if current.is_complete() {
            return Ok(Some(Transition { row: current, changed: false }));
        }

        lock_open_session(&mut *tx, current.session_id).await?;
        let updated = sqlx::query_as::<_, ArtifactRow>(&format!(
            "UPDATE artifacts
             SET status = 'complete', completed_at = now()
             WHERE id = $1 AND status = 'pending'
             RETURNING {}",
            ARTIFACT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let transition = match updated {
            Some(row) => Transition { row, changed: true },
            // A concurrent completer won; read the row it committed.
            None => Transition {
                row: sqlx::query_as::<_, ArtifactRow>(&select)
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?,
                changed: false,
            },
        };
        tx.commit().await?;
        Ok(Some(transition))
    }

    pub async fn list_artifacts(&self, session_id: Uuid) -> Result<Vec<ArtifactRow>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {} FROM artifacts WHERE session_id = $1
             ORDER BY iteration, created_at, key",
            ARTIFACT_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
