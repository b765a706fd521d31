use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

use crate::merge::{merge_job, MergedJob};
use crate::parsing::{Fragment, LineClassifier};
use crate::usage::{bucket_attempt, UsageAggregator, UsageKey, UsageValue};
use crate::Diagnostics;

/// Una partición física (archivo en disco) de jobs mergeados.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: u32,
    pub path: PathBuf,
}

fn hash_key_to_partition(key: &str, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions as u64) as u32
}

/* =========================
   Etapa 1: logs -> jobs mergeados, particionados por job id
   ========================= */

/// Clasifica cada línea de los archivos de entrada, agrupa los fragmentos
/// por job id, mergea cada grupo y reparte los jobs canónicos en
/// `part-<n>.jsonl` por hash del job id.
///
/// Las líneas que no calzan con ninguna forma y los fragmentos incompletos
/// no son errores: se cuentan en `diag` y se siguen de largo.
pub fn parse_logs_to_partitions(
    classifier: &LineClassifier,
    input_files: &[PathBuf],
    output_dir: &Path,
    num_partitions: u32,
    diag: &mut Diagnostics,
) -> Result<Vec<Partition>> {
    let num_partitions = num_partitions.max(1);

    // 1) clasificar y agrupar por job id; BTreeMap para salida determinista
    let mut by_job: BTreeMap<String, Vec<Fragment>> = BTreeMap::new();

    for path in input_files {
        let file = File::open(path)
            .with_context(|| format!("no se pudo abrir {}", path.display()))?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = line
                .with_context(|| format!("error de lectura en {}", path.display()))?;

            let Some(fragment) = classifier.classify(&line) else {
                diag.add("línea sin forma conocida");
                continue;
            };

            if !fragment.usable() {
                diag.add("fragmento incompleto");
                continue;
            }

            // usable() garantiza el job id
            if let Some(job_id) = fragment.job_id() {
                by_job.entry(job_id.to_string()).or_default().push(fragment);
            }
        }
    }

    info!(
        "{} jobs encontrados en {} archivos",
        by_job.len(),
        input_files.len()
    );

    // 2) abrir un writer por partición
    fs::create_dir_all(output_dir)
        .with_context(|| format!("no se pudo crear {}", output_dir.display()))?;

    let mut writers: Vec<BufWriter<File>> = Vec::new();
    let mut parts: Vec<Partition> = Vec::new();

    for pid in 0..num_partitions {
        let path = output_dir.join(format!("part-{}.jsonl", pid));
        let file = File::create(&path)
            .with_context(|| format!("no se pudo crear {}", path.display()))?;
        writers.push(BufWriter::new(file));
        parts.push(Partition { id: pid, path });
    }

    // 3) mergear cada job y escribirlo en la partición que le toca
    for (job_id, fragments) in by_job {
        let merged = merge_job(&job_id, fragments, diag)?;

        let pid = hash_key_to_partition(&merged.job_id, num_partitions) as usize;
        serde_json::to_writer(&mut writers[pid], &merged)?;
        writers[pid].write_all(b"\n")?;
    }

    for w in writers.iter_mut() {
        w.flush()?;
    }

    Ok(parts)
}

/// Lee un archivo de partición (JSONL) de jobs mergeados.
pub fn read_merged_jobs(path: &Path) -> Result<Vec<MergedJob>> {
    let file =
        File::open(path).with_context(|| format!("no se pudo abrir {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let job: MergedJob = serde_json::from_str(&line)
            .with_context(|| format!("registro inválido en {}", path.display()))?;
        out.push(job);
    }

    Ok(out)
}

/* =========================
   Etapa 2: jobs mergeados -> tabla de uso por hora
   ========================= */

/// Fila plana de la tabla de uso, clave y valor juntos para el CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub cluster: String,
    pub user: Option<String>,
    pub status: crate::parsing::TaskStatus,
    pub task_type: crate::parsing::TaskType,
    pub excess: bool,
    pub unit: crate::usage::TimeUnit,
    pub time: i64,
    pub elapsed_minutes: f64,
    pub cpu_minutes: Option<f64>,
    pub spilled_records: Option<i64>,
    pub reduce_shuffle_bytes: Option<i64>,
    pub started: i64,
    pub finished: i64,
}

impl UsageRow {
    fn from_entry(key: UsageKey, value: UsageValue) -> Self {
        Self {
            cluster: key.cluster,
            user: key.user,
            status: key.status,
            task_type: key.task_type,
            excess: key.excess,
            unit: key.unit,
            time: key.time,
            elapsed_minutes: value.elapsed_minutes,
            cpu_minutes: value.cpu_minutes,
            spilled_records: value.spilled_records,
            reduce_shuffle_bytes: value.reduce_shuffle_bytes,
            started: value.started,
            finished: value.finished,
        }
    }
}

/// Lee particiones de jobs mergeados, bucketea cada attempt válido por hora
/// y escribe la tabla agregada, ordenada por clave, como CSV con encabezado.
/// Devuelve la cantidad de filas escritas.
pub fn compute_usage_to_file(
    input_files: &[PathBuf],
    cluster: &str,
    output_path: &Path,
    diag: &mut Diagnostics,
) -> Result<usize> {
    let mut agg = UsageAggregator::new();

    for path in input_files {
        for job in read_merged_jobs(path)? {
            for task in &job.tasks {
                for attempt in &task.attempts {
                    for (key, value) in
                        bucket_attempt(cluster, job.user.as_deref(), attempt, diag)
                    {
                        agg.add(key, value);
                    }
                }
            }
        }
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(output_path)
        .with_context(|| format!("no se pudo crear {}", output_path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));

    let mut rows = 0;
    for (key, value) in agg.into_sorted() {
        writer.serialize(UsageRow::from_entry(key, value))?;
        rows += 1;
    }
    writer.flush()?;

    info!("{} filas de uso escritas en {}", rows, output_path.display());

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{DerivedAttemptData, MergedAttempt, MergedTask};
    use crate::parsing::{TaskStatus, TaskType};
    use std::collections::HashMap;
    use std::env;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn fresh_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = env::temp_dir().join(format!("{}_{}", name, nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_log() -> String {
        [
            r#"Job JOBID="job_201_0001" JOBNAME="wordcount" USER="ana" SUBMIT_TIME="1000""#,
            r#"Job JOBID="job_201_0001" JOB_STATUS="SUCCESS" FINISH_TIME="9000""#,
            r#"Task TASKID="task_201_0001_m_000001" TASK_TYPE="MAP" START_TIME="1500""#,
            r#"Task TASKID="task_201_0001_m_000001" TASK_TYPE="MAP" TASK_STATUS="SUCCESS" FINISH_TIME="8000""#,
            r#"MapAttempt TASK_TYPE="MAP" TASKID="task_201_0001_m_000001" TASK_ATTEMPT_ID="attempt_201_0001_m_000001_0" TASK_STATUS="SUCCESS" START_TIME="1500" FINISH_TIME="8000" COUNTERS="[(CPU_MILLISECONDS)(CPU time)(60000)]""#,
            r#"Job JOBID="job_201_0002" USER="bob" SUBMIT_TIME="2000""#,
            "esta línea no calza con nada",
        ]
        .join("\n")
    }

    #[test]
    fn clasifica_mergea_y_particiona_un_log_completo() {
        let tmp = fresh_dir("engine_parse");
        let log_path = tmp.join("historia.log");
        fs::write(&log_path, sample_log()).unwrap();

        let classifier = LineClassifier::new().unwrap();
        let mut diag = Diagnostics::new();

        let parts = parse_logs_to_partitions(
            &classifier,
            &[log_path],
            &tmp.join("jobs"),
            2,
            &mut diag,
        )
        .unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(diag.count("línea sin forma conocida"), 1);

        let mut jobs: Vec<MergedJob> = Vec::new();
        for part in &parts {
            jobs.extend(read_merged_jobs(&part.path).unwrap());
        }
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));

        assert_eq!(jobs.len(), 2);

        let first = &jobs[0];
        assert_eq!(first.job_id, "job_201_0001");
        assert_eq!(first.user.as_deref(), Some("ana"));
        assert_eq!(first.finish_time, Some(9000));
        assert_eq!(first.tasks.len(), 1);
        assert_eq!(first.tasks[0].attempts.len(), 1);

        let attempt = &first.tasks[0].attempts[0];
        assert_eq!(attempt.status, TaskStatus::Success);
        assert!(!attempt.derived.excess);
        assert_eq!(attempt.derived.cpu_minutes, Some(1.0));

        assert_eq!(jobs[1].job_id, "job_201_0002");
        assert_eq!(jobs[1].user.as_deref(), Some("bob"));
        assert!(jobs[1].tasks.is_empty());
    }

    #[test]
    fn fragmentos_incompletos_se_cuentan_y_no_rompen_nada() {
        let tmp = fresh_dir("engine_incompleto");
        let log_path = tmp.join("historia.log");
        // el task id no tiene la forma esperada: no se puede derivar job id
        fs::write(
            &log_path,
            r#"Task TASKID="tarea_rara_123" TASK_TYPE="MAP" TASK_STATUS="SUCCESS""#,
        )
        .unwrap();

        let classifier = LineClassifier::new().unwrap();
        let mut diag = Diagnostics::new();

        let parts = parse_logs_to_partitions(
            &classifier,
            &[log_path],
            &tmp.join("jobs"),
            1,
            &mut diag,
        )
        .unwrap();

        assert_eq!(diag.count("fragmento incompleto"), 1);
        assert!(read_merged_jobs(&parts[0].path).unwrap().is_empty());
    }

    #[test]
    fn cada_job_cae_en_una_sola_particion() {
        let tmp = fresh_dir("engine_hash");
        let mut lines = Vec::new();
        for i in 0..20 {
            lines.push(format!(
                r#"Job JOBID="job_201_{:04}" USER="ana" SUBMIT_TIME="1000""#,
                i
            ));
        }
        let log_path = tmp.join("historia.log");
        fs::write(&log_path, lines.join("\n")).unwrap();

        let classifier = LineClassifier::new().unwrap();
        let parts = parse_logs_to_partitions(
            &classifier,
            &[log_path],
            &tmp.join("jobs"),
            4,
            &mut Diagnostics::new(),
        )
        .unwrap();

        let mut seen: Vec<String> = Vec::new();
        for part in &parts {
            for job in read_merged_jobs(&part.path).unwrap() {
                assert_eq!(
                    hash_key_to_partition(&job.job_id, 4),
                    part.id,
                    "el job {} quedó en la partición equivocada",
                    job.job_id
                );
                seen.push(job.job_id);
            }
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }

    fn merged_job_with_attempt(start: i64, finish: i64) -> MergedJob {
        MergedJob {
            job_id: "job_201_0001".to_string(),
            user: Some("ana".to_string()),
            tasks: vec![MergedTask {
                task_id: "task_201_0001_m_000001".to_string(),
                task_type: Some(TaskType::Map),
                status: Some(TaskStatus::Success),
                attempts: vec![MergedAttempt {
                    task_attempt_id: "attempt_201_0001_m_000001_0".to_string(),
                    task_id: "task_201_0001_m_000001".to_string(),
                    job_id: Some("job_201_0001".to_string()),
                    task_type: TaskType::Map,
                    status: TaskStatus::Success,
                    start_time: Some(start),
                    finish_time: Some(finish),
                    shuffle_finished: None,
                    sort_finished: None,
                    counters: HashMap::new(),
                    derived: DerivedAttemptData::default(),
                }],
                ..MergedTask::default()
            }],
            ..MergedJob::default()
        }
    }

    #[test]
    fn calcula_el_uso_y_lo_escribe_como_csv() {
        const HOUR: i64 = 3_600_000;
        const MINUTE: i64 = 60_000;

        let tmp = fresh_dir("engine_usage");
        let jobs_path = tmp.join("part-0.jsonl");

        // 13:45 -> 15:10
        let job = merged_job_with_attempt(13 * HOUR + 45 * MINUTE, 15 * HOUR + 10 * MINUTE);
        fs::write(&jobs_path, serde_json::to_string(&job).unwrap() + "\n").unwrap();

        let out_path = tmp.join("usage.csv");
        let rows = compute_usage_to_file(
            &[jobs_path],
            "grid",
            &out_path,
            &mut Diagnostics::new(),
        )
        .unwrap();

        assert_eq!(rows, 3);

        let mut reader = csv::Reader::from_path(&out_path).unwrap();
        let rows: Vec<UsageRow> = reader
            .deserialize()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].cluster, "grid");
        assert_eq!(rows[0].user.as_deref(), Some("ana"));
        assert_eq!(rows[0].time, 13 * HOUR);
        assert_eq!(rows[0].elapsed_minutes, 15.0);
        assert_eq!(rows[0].started, 1);
        assert_eq!(rows[2].time, 15 * HOUR);
        assert_eq!(rows[2].elapsed_minutes, 10.0);
        assert_eq!(rows[2].finished, 1);

        let total: f64 = rows.iter().map(|r| r.elapsed_minutes).sum();
        assert_eq!(total, 85.0);
    }

    #[test]
    fn sin_attempts_el_csv_queda_solo_con_encabezado() {
        let tmp = fresh_dir("engine_usage_vacio");
        let jobs_path = tmp.join("part-0.jsonl");
        fs::write(&jobs_path, "").unwrap();

        let out_path = tmp.join("usage.csv");
        let rows = compute_usage_to_file(
            &[jobs_path],
            "grid",
            &out_path,
            &mut Diagnostics::new(),
        )
        .unwrap();

        assert_eq!(rows, 0);
        assert!(out_path.exists());
    }
}
