use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use eventindex::api::{ApiState, start_http_server};
use eventindex::config::AppConfig;
use eventindex::corpus::{RunLog, RunMode, SqliteStore, archive};
use eventindex::rebuild::{Pipeline, RebuildState, Rebuilder};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "eventindex",
    version,
    about = "Sync a cultural event corpus and serve semantic search over it"
)]
struct Cli {
    /// Configuration file (defaults to ./eventindex.toml, then the user config dir).
    #[arg(long, short, global = true, env = "EVENTINDEX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (search, rebuild trigger, status).
    Serve,
    /// Run one rebuild in the foreground.
    Rebuild {
        /// Full rebuild instead of an incremental update.
        #[arg(long)]
        full: bool,
    },
    /// Search the current index.
    Search {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Show the latest recorded pipeline run.
    LastRun {
        /// Show this many runs, newest first.
        #[arg(long)]
        history: Option<usize>,
    },
    /// List and delete archived collections.
    Backups {
        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
        /// Delete without asking for confirmation.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = eventindex::telemetry::init(&config.logging);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Rebuild { full } => rebuild(config, full).await,
        Command::Search { query, k } => search(config, &query, k).await,
        Command::LastRun { history } => last_run(config, history).await,
        Command::Backups { dry_run, force } => backups(config, dry_run, force).await,
    }
}

async fn rebuilder(config: &AppConfig) -> anyhow::Result<Arc<Rebuilder>> {
    let pipeline = Pipeline::from_config(config)
        .await
        .context("failed to set up the rebuild pipeline")?;
    let rebuilder = Rebuilder::new(Arc::new(pipeline));
    rebuilder.initialize().await?;
    Ok(rebuilder)
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let rebuilder = rebuilder(&config).await?;
    let state = Arc::new(ApiState::new(rebuilder.clone(), config.index.default_k));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = start_http_server(config.api.bind, state, shutdown_rx).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    if rebuilder.cancel() {
        let last = rebuilder.wait().await;
        tracing::info!(state = ?last.state, "rebuild stopped");
    }
    shutdown_tx.send_replace(true);
    server.await.context("HTTP server task failed")?;
    Ok(())
}

async fn rebuild(config: AppConfig, full: bool) -> anyhow::Result<()> {
    let rebuilder = rebuilder(&config).await?;
    let mode = if full {
        RunMode::Full
    } else {
        RunMode::Incremental
    };

    let interrupt = {
        let rebuilder = rebuilder.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                rebuilder.cancel();
            }
        })
    };

    rebuilder.trigger(mode);
    let last = rebuilder.wait().await;
    interrupt.abort();

    println!("{}", serde_json::to_string_pretty(&last)?);
    match last.state {
        RebuildState::Error => bail!("rebuild failed: {}", last.message),
        _ => Ok(()),
    }
}

async fn search(config: AppConfig, query: &str, k: Option<usize>) -> anyhow::Result<()> {
    let rebuilder = rebuilder(&config).await?;
    let hits = rebuilder
        .search(query, k.unwrap_or(config.index.default_k))
        .await?;

    if hits.is_empty() {
        println!("no results");
    }
    for (rank, hit) in hits.iter().enumerate() {
        let metadata = &hit.chunk.metadata;
        println!(
            "{}. [{:.4}] {} ({})",
            rank + 1,
            hit.distance,
            if metadata.title.is_empty() { "untitled" } else { &metadata.title },
            metadata.city.as_deref().unwrap_or("unknown city"),
        );
        println!("   {}", hit.chunk.text.replace('\n', " "));
    }
    Ok(())
}

async fn last_run(config: AppConfig, history: Option<usize>) -> anyhow::Result<()> {
    let store = SqliteStore::connect(&config.store.path).await?;
    let runs = RunLog::new(store.pool().clone()).await?;

    let records = match history {
        Some(limit) => runs.history(limit).await?,
        None => runs.latest_run().await?.into_iter().collect(),
    };
    if records.is_empty() {
        println!("no pipeline run recorded yet");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn backups(config: AppConfig, dry_run: bool, force: bool) -> anyhow::Result<()> {
    let store = SqliteStore::connect(&config.store.path).await?;
    let found = archive::list_backups(&store).await?;
    if found.is_empty() {
        println!("no backup collections");
        return Ok(());
    }

    for backup in &found {
        println!(
            "{:<48} {:>8} documents  {}",
            backup.name,
            backup.count,
            backup.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if !dry_run && !force {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Delete {} backup collections?", found.len()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("nothing deleted");
            return Ok(());
        }
    }

    let report = archive::delete_backups(&store, &found, dry_run).await?;
    let verb = if report.dry_run { "would delete" } else { "deleted" };
    println!(
        "{verb} {} collections ({} documents)",
        report.collections.len(),
        report.documents
    );
    Ok(())
}
