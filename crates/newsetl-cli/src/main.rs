mod logging;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use newsetl_core::SCHEMA_VERSION;
use newsetl_storage::RecordStore;
use newsetl_sync::{build_scheduler, open_store, SyncConfig};
use newsetl_web::AppState;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "newsetl-cli")]
#[command(about = "Scheduled news article ETL")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "NEWSETL_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and print the run summary.
    Sync,
    /// Create or rebuild the article table for this build's record shape.
    Migrate,
    /// Serve the read API, running the scheduler when enabled.
    Serve {
        #[arg(long, env = "NEWSETL_WEB_PORT", default_value_t = 3000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let run = newsetl_sync::run_sync_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if !run.is_success() {
                let cause = run.failure.as_ref().map(|f| f.cause.as_str()).unwrap_or("unknown");
                bail!("sync run {} failed: {cause}", run.run_id);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            let outcome = store
                .ensure_schema(SCHEMA_VERSION)
                .await
                .context("ensuring article schema")?;
            println!("schema version {SCHEMA_VERSION}: {outcome:?}");
        }
        Commands::Serve { port } => serve(port).await?,
    }

    Ok(())
}

async fn serve(port: u16) -> Result<()> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    let outcome = store
        .ensure_schema(SCHEMA_VERSION)
        .await
        .context("ensuring article schema")?;
    info!(version = SCHEMA_VERSION, ?outcome, "schema ready");

    let scheduler = build_scheduler(&config, store.clone())?;
    let handle = if config.scheduler_enabled {
        Some(scheduler.clone().start().await?)
    } else {
        warn!("scheduler disabled; serving reads only");
        None
    };

    let state = AppState::new(store).with_scheduler(scheduler);
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "listening for ctrl-c failed; serving until killed");
            std::future::pending::<()>().await;
        }
    };
    let served = newsetl_web::serve(port, state, shutdown).await;

    if let Some(handle) = handle {
        handle.shutdown().await?;
    }
    served
}
