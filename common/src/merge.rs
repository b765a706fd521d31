use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::parsing::{AttemptFragment, Fragment, JobFragment, JobStatus, TaskStatus, TaskType};
use crate::{Diagnostics, JobId, TaskAttemptId, TaskId, CPU_MILLISECONDS};

/* --------- Registros canónicos: la vista mergeada de un job --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedAttemptData {
    /// finish - start en minutos; sólo si ambos tiempos son válidos y no cero.
    pub minutes: Option<f64>,
    /// Derivado del contador CPU_MILLISECONDS, independiente de los tiempos.
    pub cpu_minutes: Option<f64>,
    /// false para el intento "que valió" de la task; true para el resto.
    pub excess: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedAttempt {
    pub task_attempt_id: TaskAttemptId,
    pub task_id: TaskId,
    pub job_id: Option<JobId>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub shuffle_finished: Option<i64>,
    pub sort_finished: Option<i64>,
    pub counters: HashMap<String, i64>,
    pub derived: DerivedAttemptData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedTask {
    pub task_id: TaskId,
    pub job_id: Option<JobId>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub attempts: Vec<MergedAttempt>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedJob {
    pub job_id: JobId,
    pub user: Option<String>,
    pub job_name: Option<String>,
    pub job_queue: Option<String>,
    pub job_status: Option<JobStatus>,
    pub submit_time: Option<i64>,
    pub launch_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub total_maps: Option<i32>,
    pub total_reduces: Option<i32>,
    pub finished_maps: Option<i32>,
    pub finished_reduces: Option<i32>,
    pub failed_maps: Option<i32>,
    pub failed_reduces: Option<i32>,
    pub tasks: Vec<MergedTask>,
}

/* --------- Merge de fragmentos por job id --------- */

/// Combina todos los fragmentos de un mismo job id (en orden de entrada,
/// con repeticiones posibles) en un único registro canónico.
///
/// Un attempt que referencia una task inexistente indica entrada corrupta
/// y es error para este job; los demás jobs del día no se ven afectados.
pub fn merge_job(
    job_id: &str,
    fragments: Vec<Fragment>,
    diag: &mut Diagnostics,
) -> Result<MergedJob> {
    let mut job_entries: Vec<JobFragment> = Vec::new();
    let mut task_entries: Vec<crate::parsing::TaskFragment> = Vec::new();
    let mut attempt_entries: Vec<AttemptFragment> = Vec::new();

    for fragment in fragments {
        match fragment {
            Fragment::Job(j) => job_entries.push(j),
            Fragment::Task(t) => task_entries.push(t),
            Fragment::Attempt(a) => attempt_entries.push(a),
        }
    }

    let mut job = MergedJob {
        job_id: job_id.to_string(),
        ..MergedJob::default()
    };

    merge_job_fields(&mut job, &job_entries);
    job.tasks = merge_tasks(&task_entries);
    attach_attempts(&mut job, attempt_entries, diag)?;

    Ok(job)
}

/// Fold izquierda→derecha: el último valor no nulo gana.
/// status y finish_time se toman como par atómico, porque el status
/// aparece varias veces mientras el job transita estados intermedios.
fn merge_job_fields(job: &mut MergedJob, entries: &[JobFragment]) {
    for line in entries {
        if line.job_status.is_some() && line.finish_time.is_some() {
            job.job_status = line.job_status;
            job.finish_time = line.finish_time;
        }
        if let Some(v) = &line.user {
            job.user = Some(v.clone());
        }
        if let Some(v) = &line.job_name {
            job.job_name = Some(v.clone());
        }
        if let Some(v) = &line.job_queue {
            job.job_queue = Some(v.clone());
        }
        if line.submit_time.is_some() {
            job.submit_time = line.submit_time;
        }
        if line.launch_time.is_some() {
            job.launch_time = line.launch_time;
        }
        if line.total_maps.is_some() {
            job.total_maps = line.total_maps;
        }
        if line.total_reduces.is_some() {
            job.total_reduces = line.total_reduces;
        }
        if line.finished_maps.is_some() {
            job.finished_maps = line.finished_maps;
        }
        if line.finished_reduces.is_some() {
            job.finished_reduces = line.finished_reduces;
        }
        if line.failed_maps.is_some() {
            job.failed_maps = line.failed_maps;
        }
        if line.failed_reduces.is_some() {
            job.failed_reduces = line.failed_reduces;
        }
    }
}

/// Agrupa por task id; los fragmentos posteriores pisan los campos no nulos.
/// El resultado queda ordenado ascendente por task id.
fn merge_tasks(entries: &[crate::parsing::TaskFragment]) -> Vec<MergedTask> {
    let mut by_id: BTreeMap<TaskId, MergedTask> = BTreeMap::new();

    for entry in entries {
        let Some(task_id) = entry.task_id.clone() else {
            continue;
        };

        let task = by_id.entry(task_id.clone()).or_insert_with(|| MergedTask {
            task_id,
            ..MergedTask::default()
        });

        if entry.job_id.is_some() {
            task.job_id = entry.job_id.clone();
        }
        if entry.task_type.is_some() {
            task.task_type = entry.task_type;
        }
        if entry.status.is_some() {
            task.status = entry.status;
        }
        if entry.start_time.is_some() {
            task.start_time = entry.start_time;
        }
        if entry.finish_time.is_some() {
            task.finish_time = entry.finish_time;
        }
    }

    by_id.into_values().collect()
}

/// Merge de attempts por task attempt id, filtrado de datos malos,
/// y cálculo de los campos derivados (minutos, cpu, excess).
fn attach_attempts(
    job: &mut MergedJob,
    entries: Vec<AttemptFragment>,
    diag: &mut Diagnostics,
) -> Result<()> {
    // 1) combinar las entradas de cada attempt en un acumulador
    let mut by_id: HashMap<TaskAttemptId, AttemptFragment> = HashMap::new();

    for entry in entries {
        let Some(attempt_id) = entry.task_attempt_id.clone() else {
            diag.add("attempt sin task attempt id");
            continue;
        };

        let acc = by_id.entry(attempt_id.clone()).or_default();
        acc.task_attempt_id = Some(attempt_id);

        if entry.task_type.is_some() {
            acc.task_type = entry.task_type;
        }
        if entry.job_id.is_some() {
            acc.job_id = entry.job_id;
        }
        if entry.task_id.is_some() {
            acc.task_id = entry.task_id;
        }
        // los logs repiten líneas con timestamps refinados: nos quedamos
        // con el mayor visto
        acc.start_time = later(acc.start_time, entry.start_time);
        acc.finish_time = later(acc.finish_time, entry.finish_time);
        acc.shuffle_finished = later(acc.shuffle_finished, entry.shuffle_finished);
        acc.sort_finished = later(acc.sort_finished, entry.sort_finished);

        if entry.status.is_some() {
            acc.status = entry.status;
        }
        // los contadores se reemplazan enteros, no campo a campo
        if !entry.counters.is_empty() {
            acc.counters = entry.counters;
        }
    }

    // 2) filtrar datos malos (logs cortados); se cuenta, no es error
    let mut filtered: Vec<MergedAttempt> = Vec::new();

    for acc in by_id.into_values() {
        let Some(task_attempt_id) = acc.task_attempt_id else {
            continue;
        };
        let Some(task_id) = acc.task_id else {
            diag.add("attempt sin task id");
            continue;
        };
        let Some(task_type) = acc.task_type else {
            diag.add("attempt sin tipo");
            continue;
        };
        let Some(status) = acc.status else {
            diag.add("attempt sin status");
            continue;
        };
        let Some(start) = acc.start_time else {
            diag.add("attempt sin start time");
            continue;
        };
        let Some(finish) = acc.finish_time else {
            diag.add("attempt sin finish time");
            continue;
        };
        if finish < start {
            diag.add("finish anterior al start");
            continue;
        }

        filtered.push(MergedAttempt {
            task_attempt_id,
            task_id,
            job_id: acc.job_id,
            task_type,
            status,
            start_time: Some(start),
            finish_time: Some(finish),
            shuffle_finished: acc.shuffle_finished,
            sort_finished: acc.sort_finished,
            counters: acc.counters,
            derived: DerivedAttemptData::default(),
        });
    }

    // 3) colgar cada attempt de su task
    let mut index: HashMap<TaskId, usize> = HashMap::new();
    for (i, task) in job.tasks.iter().enumerate() {
        index.insert(task.task_id.clone(), i);
    }

    for attempt in filtered {
        match index.get(&attempt.task_id) {
            Some(&i) => job.tasks[i].attempts.push(attempt),
            None => bail!(
                "el attempt {} referencia la task {} que no existe en el job {}",
                attempt.task_attempt_id,
                attempt.task_id,
                job.job_id
            ),
        }
    }

    // 4) derivados y marca de excess por task
    for task in &mut job.tasks {
        if task.attempts.is_empty() {
            continue;
        }

        // orden por start time para decidir cuál intento "valió"
        task.attempts.sort_by_key(|a| a.start_time);

        // el primer SUCCESS en orden de arranque; si ninguno terminó bien,
        // el primero que arrancó. Intentos exitosos solapados son raros y
        // se ignoran a propósito.
        let principal = task
            .attempts
            .iter()
            .position(|a| a.status == TaskStatus::Success)
            .unwrap_or(0);

        for (i, attempt) in task.attempts.iter_mut().enumerate() {
            if attempt.start_time == Some(0) || attempt.finish_time == Some(0) {
                attempt.start_time = None;
                attempt.finish_time = None;
                diag.add("start o finish en cero");
            } else if let (Some(start), Some(finish)) = (attempt.start_time, attempt.finish_time)
            {
                attempt.derived.minutes = Some((finish - start) as f64 / 1000.0 / 60.0);
            }

            if let Some(cpu) = attempt.counters.get(CPU_MILLISECONDS) {
                attempt.derived.cpu_minutes = Some(*cpu as f64 / 1000.0 / 60.0);
            }

            attempt.derived.excess = i != principal;
        }

        // orden externo estable para la salida
        task.attempts
            .sort_by(|a, b| a.task_attempt_id.cmp(&b.task_attempt_id));
    }

    Ok(())
}

fn later(current: Option<i64>, seen: Option<i64>) -> Option<i64> {
    match (current, seen) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
