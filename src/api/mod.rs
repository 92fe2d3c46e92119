//! # API: HTTP Server for the Session Control Plane
//!
//! Runs an Axum HTTP server exposing the versioned `/api/v1` surface (credential
//! minting, projects, sessions, iterations, tasks, run history, gates,
//! artifacts) plus the unauthenticated operational probes.
//!
//! Handlers are stateless over a shared [`AppState`]. The only in-process
//! mutable state is the rate limiter's window map and the Prometheus atomics;
//! everything durable lives in PostgreSQL.
//!
//! ## Request pipeline
//!
//! authenticate → rate limit (mutations) → scope and ownership → closed-session
//! check → body validation → presign → mutation → audit append.
//!
//! Authentication and rate limiting happen in the extractors of
//! [`middleware_auth`]; handlers take their JSON body as a
//! `Result<Json<_>, JsonRejection>` and unwrap it only after scope checks, so
//! a malformed body never reveals anything to an out-of-scope caller.

pub(crate) mod middleware_auth;
mod routes_artifacts;
mod routes_auth;
mod routes_gates;
mod routes_health;
mod routes_projects;
mod routes_runs;
mod routes_tasks;

use anyhow::Result;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::audit::Redactor;
use crate::auth::TokenMinter;
use crate::config::Config;
use crate::db::Database;
use crate::gates::GatePolicy;
use crate::prom_metrics;
use crate::rate_limit::RateLimiter;
use crate::storage::{ObjectStore, S3Presigner};

pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub minter: TokenMinter,
    pub limiter: RateLimiter,
    pub redactor: Redactor,
    pub storage: Arc<dyn ObjectStore>,
    pub gate_policy: GatePolicy,
    pub prom_metrics: prom_metrics::Metrics,
}

impl AppState {
    pub fn with_parts(
        db: Database,
        config: Config,
        limiter: RateLimiter,
        storage: Arc<dyn ObjectStore>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            minter: TokenMinter::new(
                config.api_key.as_deref(),
                &config.signing_key,
                config.token_ttl,
            ),
            redactor: Redactor::new(config.redact_keys.iter()),
            gate_policy: GatePolicy {
                min_coverage_percent: config.min_coverage_percent,
            },
            prom_metrics: prom_metrics::Metrics::new(),
            db,
            config,
            limiter,
            storage,
        })
    }
}

/// Middleware that records HTTP request duration into the Prometheus histogram,
/// generates (or propagates) a request ID for correlation, and wraps the
/// request in a tracing span using `.instrument()` for proper async propagation.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    let duration = start.elapsed().as_secs_f64();
    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(duration);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Normalize URL path to collapse high-cardinality segments (UUIDs, numeric IDs)
/// into placeholders, preventing histogram label explosion.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if uuid::Uuid::parse_str(seg).is_ok() {
                ":uuid".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/auth/token", post(routes_auth::handler_api_token_mint))
        .route("/api/v1/auth/me", get(routes_auth::handler_api_me))
        // Scoping hierarchy
        .route(
            "/api/v1/projects",
            post(routes_projects::handler_api_projects_create),
        )
        .route(
            "/api/v1/projects/{project_id}",
            get(routes_projects::handler_api_project_get),
        )
        .route(
            "/api/v1/projects/{project_id}/sessions",
            get(routes_projects::handler_api_sessions_list)
                .post(routes_projects::handler_api_sessions_create),
        )
        .route(
            "/api/v1/sessions/{session_id}",
            get(routes_projects::handler_api_session_get),
        )
        .route(
            "/api/v1/sessions/{session_id}/close",
            post(routes_projects::handler_api_session_close),
        )
        .route(
            "/api/v1/sessions/{session_id}/iterations",
            get(routes_projects::handler_api_iterations_list)
                .post(routes_projects::handler_api_iterations_open),
        )
        // Task registry
        .route(
            "/api/v1/sessions/{session_id}/tasks",
            get(routes_tasks::handler_api_tasks_list).put(routes_tasks::handler_api_tasks_upsert),
        )
        // Run recorder
        .route(
            "/api/v1/sessions/{session_id}/test-runs",
            post(routes_runs::handler_api_test_run_record),
        )
        .route(
            "/api/v1/sessions/{session_id}/test-runs/latest",
            get(routes_runs::handler_api_test_run_latest),
        )
        .route(
            "/api/v1/sessions/{session_id}/coverage-runs",
            post(routes_runs::handler_api_coverage_run_record),
        )
        .route(
            "/api/v1/sessions/{session_id}/coverage-runs/latest",
            get(routes_runs::handler_api_coverage_run_latest),
        )
        .route(
            "/api/v1/sessions/{session_id}/security-checks",
            post(routes_runs::handler_api_security_check_record),
        )
        .route(
            "/api/v1/sessions/{session_id}/security-checks/latest",
            get(routes_runs::handler_api_security_check_latest),
        )
        // Gates
        .route(
            "/api/v1/sessions/{session_id}/gates/evaluate",
            get(routes_gates::handler_api_gates_evaluate),
        )
        // Artifact broker
        .route(
            "/api/v1/sessions/{session_id}/artifacts",
            get(routes_artifacts::handler_api_artifacts_list),
        )
        .route(
            "/api/v1/sessions/{session_id}/artifacts/presign-put",
            post(routes_artifacts::handler_api_artifact_presign_put),
        )
        .route(
            "/api/v1/sessions/{session_id}/artifacts/{artifact_id}/presign-get",
            get(routes_artifacts::handler_api_artifact_presign_get),
        )
        .route(
            "/api/v1/artifacts/{artifact_id}/complete",
            post(routes_artifacts::handler_api_artifact_complete),
        )
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

pub async fn run(port: u16, database_url: &str, migrate: bool) -> Result<()> {
    let config = Config::from_env()?;
    let database = Database::connect(database_url, config.database_max_connections).await?;
    if migrate {
        database.apply_schema().await?;
        info!("schema applied");
    }
    if config.api_key.is_none() {
        warn!("GATEHOUSE_API_KEY not set; credential minting is disabled");
    }

    let mut limiter = RateLimiter::new(config.rate_limit_window, config.rate_limit_max_requests);
    if let Some(redis_url) = &config.redis_url {
        let client = redis::Client::open(redis_url.as_str())?;
        match redis::aio::ConnectionManager::new(client).await {
            Ok(conn) => {
                info!("rate limiter counters shared through redis");
                limiter = limiter.with_redis(conn);
            }
            Err(e) => warn!(error = %e, "redis unreachable, using in-process rate limiter"),
        }
    }
    let storage: Arc<dyn ObjectStore> = Arc::new(S3Presigner::new(config.storage.clone()));
    let state = AppState::with_parts(database, config, limiter, storage);
    let app = build_router(state.clone());

    // Background task: drop idle rate-limit windows so the map stays bounded.
    let prune_state = Arc::clone(&state);
    tokio::spawn(async move {
        let period = prune_state.limiter.window().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let removed = prune_state.limiter.prune(std::time::Instant::now());
            if removed > 0 {
                tracing::debug!(removed, "pruned idle rate-limit windows");
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "gatehouse listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("gatehouse shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
