use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use handle_watch::config;
use handle_watch::db::{self, SqliteStore};
use handle_watch::service::{TickOutcome, Trigger, WatchService};

#[derive(Debug, Parser)]
#[command(author, version, about = "Periodically re-check monitored handles")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool));
    let service = WatchService::from_config(&cfg, store)?;

    let mut sweep = tokio::time::interval(cfg.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup = tokio::time::interval(cfg.cleanup_interval());
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        sweep_secs = cfg.app.sweep_interval_secs,
        cleanup_secs = cfg.app.cleanup_interval_secs,
        "starting handle watcher"
    );
    loop {
        let trigger = tokio::select! {
            _ = sweep.tick() => Trigger::Sweep,
            _ = cleanup.tick() => Trigger::Cleanup,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        };
        match service.on_tick(trigger).await {
            Ok(TickOutcome::Swept(report)) => {
                for (id, err) in &report.persistence_errors {
                    error!(%id, %err, "handle result was not saved");
                }
                for handle in &report.available_handles {
                    info!(
                        id = %handle.id,
                        platform = %handle.platform,
                        name = %handle.name,
                        "handle is now available"
                    );
                }
            }
            Ok(TickOutcome::Cleaned(_)) => {}
            Err(err) => error!(?trigger, %err, "scheduled run failed"),
        }
    }

    Ok(())
}
