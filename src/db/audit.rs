//! Audit log appends and reads. Rows are never updated or deleted here.

use anyhow::Result;

use super::{AuditLogRow, Database};
use crate::audit::AuditEvent;

impl Database {
    /// Append an already-redacted audit event. Returns the new row id.
    pub async fn insert_audit_event(&self, event: &AuditEvent) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO audit_log (actor_fingerprint, action, target_entity, payload)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(&event.actor_fingerprint)
        .bind(event.action)
        .bind(&event.target_entity)
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Audit entries for one target, oldest first.
    pub async fn audit_entries_for(&self, target_entity: &str) -> Result<Vec<AuditLogRow>> {
        let rows = sqlx::query_as::<_, AuditLogRow>(
            "SELECT id, actor_fingerprint, action, target_entity, payload, created_at
             FROM audit_log WHERE target_entity = $1
             ORDER BY id",
        )
        .bind(target_entity)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
