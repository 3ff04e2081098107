use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use handle_watch::config;
use handle_watch::db::{self, NewHandle, SqliteStore};
use handle_watch::platform::{normalize_handle, Platform, PlatformRegistry};
use handle_watch::service::WatchService;

#[derive(Debug, Parser)]
#[command(author, version, about = "Register handles and run availability checks by hand")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a handle to watch
    Add {
        #[arg(long)]
        platform: String,
        #[arg(long)]
        name: String,
        /// Do not flag the handle for notifications when it frees up
        #[arg(long)]
        no_notify: bool,
        /// Exclude the handle from scheduled sweeps
        #[arg(long)]
        no_monitor: bool,
    },
    /// List registered handles
    List,
    /// Show status transitions for a handle
    History {
        #[arg(long)]
        id: String,
    },
    /// Check a single handle now
    Check {
        #[arg(long)]
        id: String,
    },
    /// Check handles in bulk
    CheckAll {
        /// Re-check every handle, not only those still being monitored
        #[arg(long)]
        refresh: bool,
    },
    /// Purge expired cache entries
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Add {
            platform,
            name,
            no_notify,
            no_monitor,
        } => {
            let registry = PlatformRegistry::builtin();
            let platform = registry
                .lookup(&platform)
                .map_err(|err| {
                    let supported: Vec<&str> =
                        registry.platforms().iter().map(Platform::as_str).collect();
                    anyhow!("{}; supported platforms: {}", err, supported.join(", "))
                })?
                .platform;
            let name = normalize_handle(&name);
            if name.is_empty() {
                return Err(anyhow!("handle name must be non-empty"));
            }
            let handle = db::insert_handle(
                &pool,
                &NewHandle {
                    name,
                    platform: platform.as_str().to_string(),
                    notifications_enabled: !no_notify,
                    monitoring_enabled: !no_monitor,
                },
            )
            .await?;
            print_json(&handle)
        }
        Command::List => print_json(&db::list_handles(&pool).await?),
        Command::History { id } => print_json(&db::history_for(&pool, &id).await?),
        Command::Check { id } => {
            let service = build_service(&cfg, pool)?;
            print_json(&service.check_single(&id).await?)
        }
        Command::CheckAll { refresh } => {
            let service = build_service(&cfg, pool)?;
            print_json(&service.check_all(refresh).await?)
        }
        Command::Cleanup => {
            let service = build_service(&cfg, pool)?;
            let removed = service.cleanup_expired().await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

fn build_service(cfg: &config::Config, pool: db::Pool) -> Result<WatchService> {
    WatchService::from_config(cfg, Arc::new(SqliteStore::new(pool)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
