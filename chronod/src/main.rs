use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};

use chronod::config::Config;
use chronod::metrics::Metrics;
use chronod::pipeline::IngestionPipeline;
use chronod::server::start_servers;
use chronod::storage::catalog::Catalog;
use chronod::storage::series::SeriesRegistry;
use chronod::storage::volume::MetaVolume;
use chronod::storage::{catalog_path, Storage};

#[derive(Parser, Debug)]
#[command(name = "chronod")]
#[command(about = "Write-optimized time-series storage daemon")]
struct Args {
    /// Path to config file
    #[arg(
        long,
        value_name = "PATH",
        env = "CHRONOD_CONFIG",
        default_value = "/etc/chronod/chronod.toml"
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the volume files, the meta-volume and the catalog
    Create,
    /// Open the database and serve the ingestion ports
    Open,
    /// Remove the database files
    Delete,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();
    let args = Args::parse();
    let config = Config::load_from(&args.config);
    match args.command {
        Command::Create => Storage::create(&config.storage).await,
        Command::Open => run(config).await,
        Command::Delete => delete_database(&config),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("chronod starting, data at {}", config.storage.path.display());
    let metrics = Arc::new(Metrics::new());
    let catalog = Arc::new(
        Catalog::open(catalog_path(&config.storage.path))
            .await
            .context("opening catalog")?,
    );
    let storage = Storage::open(&config.storage, metrics.clone(), &catalog).await?;
    let registry = storage.registry();
    let meta = storage.meta();
    let db = storage.handle();

    let pipeline = IngestionPipeline::new(
        config.ingest.nqueues,
        config.ingest.backoff_policy,
        metrics.clone(),
    );
    pipeline.start(storage);

    let servers = start_servers(&config.server, pipeline.clone(), db).await?;
    let flusher = tokio::spawn(flusher_loop(
        registry.clone(),
        meta.clone(),
        catalog.clone(),
        metrics.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping servers");

    for handle in servers {
        handle.abort();
    }
    pipeline.stop().await;
    flusher.abort();

    // Whatever the periodic flusher had not caught up on.
    persist_pending(&registry, &meta, &catalog).await;
    catalog.close().await;
    info!("chronod stopped");
    Ok(())
}

async fn persist_pending(
    registry: &Arc<SeriesRegistry>,
    meta: &Arc<MetaVolume>,
    catalog: &Catalog,
) {
    let names = registry.pull_new_names();
    if !names.is_empty() {
        if let Err(e) = catalog.append_series_names(&names).await {
            error!("series name persistence failed: {e}");
        }
    }
    if let Some(descs) = meta.take_dirty() {
        if let Err(e) = catalog.update_volumes(&descs).await {
            error!("volume descriptor persistence failed: {e}");
        }
    }
}

async fn flusher_loop(
    registry: Arc<SeriesRegistry>,
    meta: Arc<MetaVolume>,
    catalog: Arc<Catalog>,
    metrics: Arc<Metrics>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick += 1;
        metrics.rollup();
        if tick % 5 == 0 {
            persist_pending(&registry, &meta, &catalog).await;
        }
        if tick % 60 == 0 {
            info!("stats: {}", metrics.summary());
        }
    }
}

fn delete_database(config: &Config) -> anyhow::Result<()> {
    let dir = &config.storage.path;
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("volume.") || name == "meta" || name.starts_with("catalog.sqlite")
        {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("removing {name}"))?;
            info!("removed {name}");
        }
    }
    Ok(())
}
