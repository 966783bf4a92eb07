use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tv_feed::{FeedConfig, TenderFeed};
use tv_storage::{MemoryTenderStore, PgTenderStore, TenderStore};
use tv_sync::{maybe_build_scheduler, IngestionPipeline, StatusService, SyncConfig, TriggerRequest};
use tv_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "tv-cli")]
#[command(about = "Tenders Ville ingestion and feed service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once.
    Sync {
        /// Ignore the minimum interval between runs of a source.
        #[arg(long)]
        force: bool,
        /// Only run these source ids.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    Migrate,
    /// Serve the HTTP API and, if enabled, the ingestion scheduler.
    Serve,
    /// Print the ingestion status summary as JSON.
    Status,
    /// Delete tenders whose deadline passed more than the grace period ago.
    Sweep {
        #[arg(long, default_value_t = 30)]
        grace_days: i64,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(migrate: bool) -> Result<Arc<dyn TenderStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let store = PgTenderStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            if migrate {
                store.migrate().await.context("applying migrations")?;
            }
            Ok(Arc::new(store))
        }
        _ => {
            warn!("DATABASE_URL not set; using the in-memory store");
            Ok(Arc::new(MemoryTenderStore::new()))
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
        }
        trigger.cancel();
    });
    token
}

async fn serve(config: SyncConfig) -> Result<()> {
    let store = open_store(true).await?;
    let port: u16 = std::env::var("TV_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let poll = config.poll;

    let pipeline = Arc::new(IngestionPipeline::new(config, Arc::clone(&store))?);
    let feed = Arc::new(
        TenderFeed::new(Arc::clone(&store), FeedConfig::from_env()).with_fallback(pipeline.clone()),
    );
    let status = Arc::new(StatusService::new(Arc::clone(&store), pipeline.source_configs()));

    let mut scheduler = maybe_build_scheduler(pipeline.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("ingestion scheduler started");
    }

    feed.preload_in_background();
    let shutdown = shutdown_on_ctrl_c();
    let state = AppState::new(store, feed, pipeline, status)
        .with_poll_policy(poll)
        .with_shutdown(shutdown);
    tv_web::serve(state, port).await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

fn grace_period(days: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_days(days).with_context(|| format!("--grace-days {days} is out of range"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        force: false,
        sources: Vec::new(),
    }) {
        Commands::Sync { force, sources } => {
            let store = open_store(false).await?;
            let pipeline = IngestionPipeline::new(config, store)?;
            let request = TriggerRequest {
                force,
                sources: (!sources.is_empty()).then_some(sources),
                ..Default::default()
            };
            let response = pipeline.run(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                anyhow::bail!(response.error.unwrap_or_else(|| "sync failed".into()));
            }
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for migrate")?;
            PgTenderStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => serve(config).await?,
        Commands::Status => {
            let store = open_store(false).await?;
            let sources = tv_sync::load_enabled_sources(&config.workspace_root)?;
            let summary = StatusService::new(store, sources)
                .summary(chrono::Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Sweep { grace_days } => {
            let store = open_store(false).await?;
            let grace = grace_period(grace_days)?;
            let pipeline = IngestionPipeline::new(config, store)?;
            let removed = pipeline.sweep_expired(grace).await?;
            println!("removed {removed} expired tenders");
        }
    }

    Ok(())
}
