mod config;
mod executor;
mod stages;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use tracing::{error, info};

use crate::config::Config;
use crate::executor::StagedJobExecutor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("driver=info,common=info")
        .init();

    let config = Config::parse();
    config.validate()?;

    // los logs se suben en carpetas con la fecha GMT aproximada del submit
    let today = Utc::now().date_naive();
    let executor = StagedJobExecutor::new(config.concurrency);

    let result = run_pipeline(&config, &executor, today).await;

    if let Err(e) = &result {
        error!("el pipeline falló: {:#}", e);
        executor.cancel_all();
    }

    let drained = executor.drain_and_shutdown().await;
    result.and(drained)
}

async fn run_pipeline(
    config: &Config,
    executor: &StagedJobExecutor,
    today: NaiveDate,
) -> Result<()> {
    info!("etapa 1: parseo de historiales de {} clusters", config.clusters.len());
    stages::run_parse_jobs(config, executor, today).await?;

    info!("etapa 2: uso por hora");
    stages::run_usage_per_hour(config, executor, today).await?;

    info!("pipeline completo");
    Ok(())
}
