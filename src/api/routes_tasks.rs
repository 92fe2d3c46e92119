//! Task registry endpoints.
//!
//! `PUT /api/v1/sessions/{session_id}/tasks` accepts either form:
//!
//! ```json
//! {"tasks": [{"dedupeKey": "lint", "state": "done"}]}
//! {"tasks": {"lint": {"state": "done"}}}
//! ```
//!
//! The whole batch is validated before anything is written, then applied in a
//! single transaction.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::middleware_auth::{audit, require_open, Audited, RequireAuth, RequireWriter};
use super::AppState;
use crate::db::{TaskState, TaskUpsert};
use crate::error::ApiError;

const MAX_DEDUPE_KEY_LEN: usize = 200;
const MAX_TITLE_LEN: usize = 500;
const MAX_BATCH: usize = 500;

/// Fields of one task in the map form, keyed by dedupe key.
#[derive(Debug, Default, Deserialize)]
pub struct TaskFields {
    state: Option<String>,
    title: Option<String>,
    payload: Option<Value>,
}

/// One task in the list form.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    #[serde(default)]
    dedupe_key: String,
    state: Option<String>,
    title: Option<String>,
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TaskBatch {
    List(Vec<TaskItem>),
    Map(BTreeMap<String, TaskFields>),
}

#[derive(Debug, Deserialize)]
pub struct UpsertTasksRequest {
    tasks: TaskBatch,
}

/// Dedupe keys: 1-200 characters from `[A-Za-z0-9._:/-]`. The same rule is a
/// CHECK constraint on the table.
pub(crate) fn valid_dedupe_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_DEDUPE_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'/' | b'-'))
}

fn to_upsert(
    dedupe_key: String,
    state: Option<String>,
    title: Option<String>,
    payload: Option<Value>,
) -> Result<TaskUpsert, ApiError> {
    if !valid_dedupe_key(&dedupe_key) {
        return Err(ApiError::Conflict(format!(
            "malformed dedupe key {:?}: expected 1-{} characters from [A-Za-z0-9._:/-]",
            dedupe_key, MAX_DEDUPE_KEY_LEN
        )));
    }
    let state = match state {
        Some(s) => Some(TaskState::parse(&s).ok_or_else(|| {
            ApiError::InvalidInput(format!(
                "task {}: state must be one of planned, doing, blocked, done",
                dedupe_key
            ))
        })?),
        None => None,
    };
    if title.as_ref().is_some_and(|t| t.chars().count() > MAX_TITLE_LEN) {
        return Err(ApiError::InvalidInput(format!(
            "task {}: title exceeds {} characters",
            dedupe_key, MAX_TITLE_LEN
        )));
    }
    if payload.as_ref().is_some_and(|p| !p.is_object()) {
        return Err(ApiError::InvalidInput(format!(
            "task {}: payload must be a JSON object",
            dedupe_key
        )));
    }
    Ok(TaskUpsert {
        dedupe_key,
        state,
        title,
        payload,
    })
}

pub(crate) fn parse_batch(batch: TaskBatch) -> Result<Vec<TaskUpsert>, ApiError> {
    let upserts: Vec<TaskUpsert> = match batch {
        TaskBatch::List(items) => items
            .into_iter()
            .map(|t| to_upsert(t.dedupe_key, t.state, t.title, t.payload))
            .collect::<Result<_, _>>()?,
        TaskBatch::Map(map) => map
            .into_iter()
            .map(|(key, f)| to_upsert(key, f.state, f.title, f.payload))
            .collect::<Result<_, _>>()?,
    };
    if upserts.is_empty() {
        return Err(ApiError::InvalidInput("tasks must not be empty".to_string()));
    }
    if upserts.len() > MAX_BATCH {
        return Err(ApiError::InvalidInput(format!(
            "at most {} tasks per request",
            MAX_BATCH
        )));
    }
    Ok(upserts)
}

/// GET /api/v1/sessions/{session_id}/tasks
pub async fn handler_api_tasks_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let tasks = state.db.list_tasks(session_id).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

/// PUT /api/v1/sessions/{session_id}/tasks
pub async fn handler_api_tasks_upsert(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
    body: Result<Json<UpsertTasksRequest>, JsonRejection>,
) -> Result<Audited<Json<Value>>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    require_open(&session)?;
    let Json(req) = body?;
    let upserts = parse_batch(req.tasks)?;

    let rows = state.db.upsert_tasks(session_id, &upserts).await?;
    info!(session_id = %session_id, count = rows.len(), "tasks upserted");

    let audit_payload = json!({
        "tasks": upserts
            .iter()
            .map(|t| json!({
                "dedupeKey": t.dedupe_key,
                "state": t.state.map(|s| s.as_str()),
                "title": t.title,
                "payload": t.payload,
            }))
            .collect::<Vec<_>>()
    });
    let status = audit(
        &state,
        &caller,
        "task.upsert",
        format!("session:{}", session_id),
        &audit_payload,
    )
    .await;
    Ok(Audited(status, Json(json!({ "tasks": rows }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(value: Value) -> Result<Vec<TaskUpsert>, ApiError> {
        let req: UpsertTasksRequest = serde_json::from_value(value).unwrap();
        parse_batch(req.tasks)
    }

    #[test]
    fn dedupe_key_rules() {
        assert!(valid_dedupe_key("lint"));
        assert!(valid_dedupe_key("build:web/app-1.2_x"));
        assert!(valid_dedupe_key(&"k".repeat(200)));
        assert!(!valid_dedupe_key(""));
        assert!(!valid_dedupe_key(&"k".repeat(201)));
        assert!(!valid_dedupe_key("has space"));
        assert!(!valid_dedupe_key("ünïcode"));
    }

    #[test]
    fn list_form_parses() {
        let tasks = batch(json!({"tasks": [
            {"dedupeKey": "a", "state": "done"},
            {"dedupeKey": "b", "title": "Write docs", "payload": {"n": 1}}
        ]}))
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].state, Some(TaskState::Done));
        assert_eq!(tasks[1].state, None);
        assert_eq!(tasks[1].title.as_deref(), Some("Write docs"));
    }

    #[test]
    fn map_form_parses() {
        let tasks = batch(json!({"tasks": {
            "b": {"state": "planned"},
            "a": {"state": "doing"}
        }}))
        .unwrap();
        let keys: Vec<&str> = tasks.iter().map(|t| t.dedupe_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn malformed_key_is_conflict() {
        let err = batch(json!({"tasks": [{"dedupeKey": "bad key"}]})).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        let err = batch(json!({"tasks": [{"state": "done"}]})).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn bad_fields_are_invalid_input() {
        for body in [
            json!({"tasks": [{"dedupeKey": "a", "state": "finished"}]}),
            json!({"tasks": [{"dedupeKey": "a", "payload": [1, 2]}]}),
            json!({"tasks": [{"dedupeKey": "a", "title": "t".repeat(501)}]}),
            json!({"tasks": []}),
        ] {
            assert!(
                matches!(batch(body.clone()), Err(ApiError::InvalidInput(_))),
                "{}",
                body
            );
        }
    }
}
