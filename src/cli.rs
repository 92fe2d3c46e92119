//! # CLI Execution Functions
//!
//! Execution logic for the non-server subcommands, kept out of `main.rs`.

use anyhow::{Context, Result};
use gatehouse::config::Config;
use gatehouse::db;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

/// Apply the bundled schema. Every statement is idempotent, so running this
/// against an up-to-date database is a no-op.
pub async fn run_migrate(database_url: &str) -> Result<()> {
    let config = Config::from_env()?;
    let database = db::Database::connect(database_url, config.database_max_connections).await?;
    database.apply_schema().await?;
    info!("schema applied");
    Ok(())
}

/// Call `POST /api/v1/auth/token` and print the response body to stdout.
pub async fn run_token(
    server: &str,
    api_key: &str,
    role: &str,
    project_id: Option<Uuid>,
    session_id: Option<Uuid>,
) -> Result<()> {
    let url = format!("{}/api/v1/auth/token", server.trim_end_matches('/'));
    let body = json!({
        "apiKey": api_key,
        "scope": {
            "role": role,
            "projectId": project_id,
            "sessionId": session_id,
        }
    });

    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .with_context(|| format!("unexpected response from {}", url))?;
    if !status.is_success() {
        let message = payload["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("minting failed ({}): {}", status, message);
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
