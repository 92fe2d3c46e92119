//! # Main: CLI Entry Point
//!
//! Routes CLI subcommands to the server, the schema migrator, and the
//! credential client.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection for all durable state.
//!
//! Everything else (secrets, limits, storage) is read from the environment by
//! `gatehouse::config::Config`.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "gatehouse", about = "Session control plane for automated work")]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = 7070)]
        port: u16,
        /// Apply the bundled schema before serving
        #[arg(long)]
        migrate: bool,
    },
    /// Apply the bundled schema and exit
    Migrate,
    /// Mint a scoped credential from a running server
    Token {
        /// Base URL of the server (e.g. http://localhost:7070)
        #[arg(long, env = "GATEHOUSE_SERVER")]
        server: String,
        /// Role to request: admin, agent, or viewer
        #[arg(long)]
        role: String,
        /// Project the credential is scoped to
        #[arg(long)]
        project_id: Option<uuid::Uuid>,
        /// Session the credential is scoped to (requires --project-id)
        #[arg(long)]
        session_id: Option<uuid::Uuid>,
        /// Shared secret (defaults to GATEHOUSE_API_KEY)
        #[arg(long, env = "GATEHOUSE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for containers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { port, migrate } => {
            let database_url = require_database_url(&cli)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(gatehouse::api::run(*port, database_url, *migrate))
        }
        Commands::Migrate => {
            let database_url = require_database_url(&cli)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_migrate(database_url))
        }
        Commands::Token {
            server,
            role,
            project_id,
            session_id,
            api_key,
        } => {
            let api_key = api_key.as_deref().ok_or_else(|| {
                anyhow::anyhow!("GATEHOUSE_API_KEY is required (set via --api-key or env)")
            })?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_token(
                server,
                api_key,
                role,
                *project_id,
                *session_id,
            ))
        }
    }
}

fn require_database_url(cli: &Cli) -> Result<&str> {
    cli.database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)"))
}
