//! Process entry point: resolve configuration, wire the pipeline up, run
//! until interrupted, then drain in order.

mod cli;
mod config;

use clap::Parser;
use miette::miette;
use quarry_catalog::{Database, Repository};
use quarry_pipeline::{Pipeline, PipelineConfig};
use quarry_store::StoreHandle;
use quarry_store::backend::S3Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = cli::Cli::parse();
    let config = config::Config::load(&cli).map_err(|err| miette!("{err:?}"))?;
    info!(bucket = %config.bucket, region = %config.region, "starting quarry");

    let database = Database::connect(&config.database)
        .await
        .map_err(|err| miette!("opening catalog database: {err:?}"))?;
    let catalog = Repository::from(&database);

    let store: StoreHandle = Arc::new(S3Store::new(
        "source",
        &config.bucket,
        config.region.clone(),
        config.endpoint.clone(),
        &config.access_key_id,
        &config.secret_access_key,
        config.force_path_style,
    ));

    let mut pipeline_config = PipelineConfig::new(&config.artifact_dir, &config.rule_dir);
    pipeline_config.workers = config.workers;
    pipeline_config.scan_timeout = Duration::from_secs(config.scan_timeout_secs);
    pipeline_config.list_interval = Duration::from_secs(config.list_interval_secs.max(1));
    pipeline_config.refresh_interval = Duration::from_secs(config.refresh_interval_secs.max(1));

    let mut pipeline = Pipeline::new(store, catalog, pipeline_config)
        .map_err(|err| miette!("constructing pipeline: {err:?}"))?;
    pipeline.start().await.map_err(|err| miette!("starting pipeline: {err:?}"))?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
    info!("interrupt received; draining");
    pipeline.close().await;
    database.close().await;
    info!("quarry exiting");
    Ok(())
}
