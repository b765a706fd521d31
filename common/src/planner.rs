use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/* --------- Ventanas de procesamiento por cluster y día --------- */

/// Un día de un cluster que hay que (re)procesar: de dónde leer,
/// dónde escribir, y cuántos bytes hay en juego.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingWindow {
    /// `<cluster>-<yyyy-mm-dd>`, estable entre corridas.
    pub id: String,
    pub cluster: String,
    pub input_glob: String,
    pub files: Vec<PathBuf>,
    pub output_path: PathBuf,
    /// Bytes de los archivos de este día.
    pub total_bytes: u64,
    /// Bytes acumulados en lo que va del recorrido, este día incluido.
    /// El tamaño del paralelismo de la etapa de parseo sale de acá.
    pub cumulative_bytes: u64,
}

/// Una unidad de paralelismo por cada `bytes_per_partition`, mínimo una.
pub fn partitions_for_bytes(bytes: u64, bytes_per_partition: u64) -> usize {
    let n = (bytes as f64 / bytes_per_partition as f64).ceil() as usize;
    n.max(1)
}

/* --------- Recorrido hacia atrás por fecha (etapa de parseo) --------- */

/// Camina desde ayer (GMT) hacia atrás y decide qué días procesar.
/// Los logs del día corriente todavía están llegando, por eso se omite.
/// `today` se inyecta para que la política sea determinista en los tests.
#[allow(clippy::too_many_arguments)]
pub fn plan_windows(
    logs_root: &Path,
    output_root: &Path,
    cluster: &str,
    today: NaiveDate,
    incremental: bool,
    num_days: u32,
    num_days_forced: u32,
) -> Result<Vec<ProcessingWindow>> {
    let effective_days = num_days.max(num_days_forced);

    let mut windows = Vec::new();
    let mut cumulative_bytes: u64 = 0;
    let mut date = today
        .checked_sub_days(Days::new(1))
        .context("fecha fuera de rango")?;

    for i in 0..effective_days {
        let year = date.format("%Y").to_string();
        let day = date.format("%m%d").to_string();

        let pattern = format!("{}/{}/{}/{}/*.log", logs_root.display(), cluster, year, day);
        let files = matching_files(&pattern)?;

        let output_path: PathBuf = [
            output_root.to_path_buf(),
            cluster.into(),
            year.into(),
            day.into(),
        ]
        .iter()
        .collect();

        if files.is_empty() {
            info!("{} => 0 archivos", pattern);
        } else if !incremental || !output_path.exists() || i < num_days_forced {
            let mut total_bytes = 0;
            for file in &files {
                total_bytes += fs::metadata(file)
                    .with_context(|| format!("no se pudo leer el tamaño de {}", file.display()))?
                    .len();
            }
            cumulative_bytes += total_bytes;

            info!("{} => {} archivos, {} bytes", pattern, files.len(), total_bytes);

            windows.push(ProcessingWindow {
                id: format!("{}-{}", cluster, date.format("%Y-%m-%d")),
                cluster: cluster.to_string(),
                input_glob: pattern,
                files,
                output_path,
                total_bytes,
                cumulative_bytes,
            });
        } else {
            info!("{} => {} archivos (se omite)", pattern, files.len());
        }

        date = date
            .checked_sub_days(Days::new(1))
            .context("fecha fuera de rango")?;
    }

    Ok(windows)
}

/* --------- Recorrido del árbol de salida (etapa de uso por hora) --------- */

/// Recorre un árbol `<jobs_root>/<cluster>/<yyyy>/<MMdd>` ya materializado
/// y aplica la misma política de reproceso, con la antigüedad del día
/// ocupando el lugar del índice del recorrido por fecha.
pub fn plan_output_partitions(
    jobs_root: &Path,
    usage_root: &Path,
    today: NaiveDate,
    incremental: bool,
    num_days_forced: u32,
) -> Result<Vec<ProcessingWindow>> {
    let mut windows = Vec::new();
    let mut cumulative_bytes: u64 = 0;

    for cluster_dir in sorted_subdirs(jobs_root)? {
        let cluster = dir_name(&cluster_dir);

        for year_dir in sorted_subdirs(&cluster_dir)? {
            let year = dir_name(&year_dir);
            info!("buscando bajo {}", year_dir.display());

            for day_dir in sorted_subdirs(&year_dir)? {
                let day = dir_name(&day_dir);

                let Ok(date) =
                    NaiveDate::parse_from_str(&format!("{}{}", year, day), "%Y%m%d")
                else {
                    info!("{} no tiene forma de día, se ignora", day_dir.display());
                    continue;
                };

                let pattern = format!("{}/*.jsonl", day_dir.display());
                let files = matching_files(&pattern)?;
                if files.is_empty() {
                    continue;
                }

                let output_path: PathBuf = [
                    usage_root.to_path_buf(),
                    cluster.clone().into(),
                    year.clone().into(),
                    day.into(),
                ]
                .iter()
                .collect();

                let elapsed_days = (today - date).num_days().max(0) as u32;

                if !incremental || !output_path.exists() || elapsed_days < num_days_forced {
                    let mut total_bytes = 0;
                    for file in &files {
                        total_bytes += fs::metadata(file)
                            .with_context(|| {
                                format!("no se pudo leer el tamaño de {}", file.display())
                            })?
                            .len();
                    }

                    cumulative_bytes += total_bytes;

                    info!("{} => {} archivos, {} bytes", pattern, files.len(), total_bytes);

                    windows.push(ProcessingWindow {
                        id: format!("{}-{}", cluster, date.format("%Y-%m-%d")),
                        cluster: cluster.clone(),
                        input_glob: pattern,
                        files,
                        output_path,
                        total_bytes,
                        cumulative_bytes,
                    });
                } else {
                    info!("{} (se omite)", pattern);
                }
            }
        }
    }

    Ok(windows)
}

fn matching_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern)
        .with_context(|| format!("patrón de glob inválido: {}", pattern))?
    {
        files.push(entry?);
    }
    files.sort();
    Ok(files)
}

fn sorted_subdirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = fs::read_dir(root)
        .with_context(|| format!("no se pudo listar {}", root.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
