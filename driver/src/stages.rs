use anyhow::Result;
use chrono::NaiveDate;
use std::path::Path;
use tracing::info;

use common::engine::{compute_usage_to_file, parse_logs_to_partitions};
use common::parsing::LineClassifier;
use common::planner::{partitions_for_bytes, plan_output_partitions, plan_windows};
use common::Diagnostics;

use crate::config::Config;
use crate::executor::{StagedJob, StagedJobExecutor};

const PARSE_BYTES_PER_PARTITION: u64 = 12 * 1024 * 1024 * 1024;

/* --------- Etapa 1: historiales -> jobs mergeados --------- */

/// Por cada cluster: planifica los días pendientes, entrega un job de
/// parseo por día y drena el batch completo antes de pasar al cluster
/// siguiente.
pub async fn run_parse_jobs(
    config: &Config,
    executor: &StagedJobExecutor,
    today: NaiveDate,
) -> Result<()> {
    for cluster in &config.clusters {
        let windows = plan_windows(
            &config.logs_root,
            &config.jobs_root,
            cluster,
            today,
            config.incremental,
            config.num_days,
            config.num_days_forced,
        )?;

        info!("cluster {}: {} días para parsear", cluster, windows.len());

        for window in windows {
            let num_partitions =
                partitions_for_bytes(window.cumulative_bytes, PARSE_BYTES_PER_PARTITION) as u32;

            let id = window.id.clone();
            let files = window.files;

            let job = StagedJob::new(
                format!("parse-jobs-{}", id),
                &config.staging_root,
                window.output_path,
                move |staging: &Path| {
                    let classifier = LineClassifier::new()?;
                    let mut diag = Diagnostics::new();
                    parse_logs_to_partitions(
                        &classifier,
                        &files,
                        staging,
                        num_partitions,
                        &mut diag,
                    )?;
                    diag.report(&id);
                    Ok(())
                },
            );

            executor.submit(job)?;
        }

        executor.wait_for_batch().await?;
    }

    Ok(())
}

/* --------- Etapa 2: jobs mergeados -> tabla de uso por hora --------- */

/// Recorre el árbol de jobs ya publicado y calcula el uso por hora de
/// cada día pendiente, con la misma disciplina de entrega y drenaje
/// por cluster.
pub async fn run_usage_per_hour(
    config: &Config,
    executor: &StagedJobExecutor,
    today: NaiveDate,
) -> Result<()> {
    let windows = plan_output_partitions(
        &config.jobs_root,
        &config.usage_root,
        today,
        config.incremental,
        config.num_days_forced,
    )?;

    info!("{} días para calcular uso", windows.len());

    let mut current_cluster: Option<String> = None;

    for window in windows {
        if current_cluster.as_deref() != Some(window.cluster.as_str()) {
            if current_cluster.is_some() {
                executor.wait_for_batch().await?;
            }
            current_cluster = Some(window.cluster.clone());
        }

        let id = window.id.clone();
        let cluster = window.cluster;
        let files = window.files;

        let job = StagedJob::new(
            format!("usage-per-hour-{}", id),
            &config.staging_root,
            window.output_path,
            move |staging: &Path| {
                let mut diag = Diagnostics::new();
                compute_usage_to_file(&files, &cluster, &staging.join("usage.csv"), &mut diag)?;
                diag.report(&id);
                Ok(())
            },
        );

        executor.submit(job)?;
    }

    executor.wait_for_batch().await?;

    Ok(())
}
