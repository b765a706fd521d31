use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::{JobId, TaskAttemptId, TaskId};

/* --------- Enums compartidos por todo el pipeline --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Map,
    Reduce,
}

impl TaskType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MAP" => Some(TaskType::Map),
            "REDUCE" => Some(TaskType::Reduce),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failure,
}

impl JobStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(JobStatus::Success),
            "FAILURE" => Some(JobStatus::Failure),
            _ => None,
        }
    }
}

/// Estados de tasks y attempts. Los attempts especulativos que el cluster
/// mata a mitad de camino quedan en KILLED: son justamente el uso en exceso
/// que este pipeline mide, así que se conservan como dimensión propia.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILURE" => Some(TaskStatus::Failure),
            "FAILED" => Some(TaskStatus::Failed),
            "KILLED" => Some(TaskStatus::Killed),
            _ => None,
        }
    }

    /// Las líneas de Task sólo traen estados terminales simples.
    pub fn is_task_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/* --------- Fragmentos: una observación parcial por línea de log --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFragment {
    pub job_id: Option<JobId>,
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
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFragment {
    pub task_id: Option<TaskId>,
    /// Siempre derivado del task id, nunca leído de la línea.
    pub job_id: Option<JobId>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptFragment {
    pub task_attempt_id: Option<TaskAttemptId>,
    pub task_id: Option<TaskId>,
    /// Siempre derivado del task id, nunca leído de la línea.
    pub job_id: Option<JobId>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub shuffle_finished: Option<i64>,
    pub sort_finished: Option<i64>,
    pub counters: HashMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fragment {
    Job(JobFragment),
    Task(TaskFragment),
    Attempt(AttemptFragment),
}

impl Fragment {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Fragment::Job(j) => j.job_id.as_deref(),
            Fragment::Task(t) => t.job_id.as_deref(),
            Fragment::Attempt(a) => a.job_id.as_deref(),
        }
    }

    /// Un fragmento sólo sirve si trae los identificadores mínimos para
    /// poder agruparlo y colgarlo del job correcto. Las líneas truncadas
    /// producen fragmentos incompletos que se descartan sin más.
    pub fn usable(&self) -> bool {
        match self {
            Fragment::Job(j) => j.job_id.is_some(),
            Fragment::Task(t) => {
                t.job_id.is_some() && t.task_id.is_some() && t.task_type.is_some()
            }
            Fragment::Attempt(a) => {
                a.job_id.is_some()
                    && a.task_id.is_some()
                    && a.task_attempt_id.is_some()
                    && a.task_type.is_some()
            }
        }
    }
}

/* --------- Clasificador de líneas --------- */

/// Clasifica una línea cruda del historial en un fragmento tipado.
/// Prueba las tres formas en orden (Job, Attempt, Task); una línea que
/// no calza con ninguna no produce fragmento y no es un error.
pub struct LineClassifier {
    job_line: Regex,
    job_id: Regex,
    parameter: Regex,
    counter: Regex,
    task_id: Regex,
    task_line: Regex,
    attempt_line: Regex,
}

impl LineClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            job_line: Regex::new(r#"^Job JOBID="([^"]+)".*"#)?,
            job_id: Regex::new(r"job_\d+_\d+")?,
            parameter: Regex::new(r#"([A-Z_]+)="([^"]+)""#)?,
            counter: Regex::new(r"\[\(([A-Z_]+)\)\(.+?\)\((\d+)\)\]")?,
            task_id: Regex::new(r"^task_(\d+_\d+)_[mr]_\d+$")?,
            task_line: Regex::new(r#"^Task TASKID="([^"]+)" TASK_TYPE="(MAP|REDUCE)".+"#)?,
            attempt_line: Regex::new(r#"^(Map|Reduce)Attempt TASK_TYPE="(MAP|REDUCE)".+"#)?,
        })
    }

    pub fn classify(&self, line: &str) -> Option<Fragment> {
        // las comillas escapadas rompen los patrones
        let line = line.replace("\\\"", "");

        if let Some(job) = self.try_parse_job(&line) {
            return Some(Fragment::Job(job));
        }
        if let Some(attempt) = self.try_parse_attempt(&line) {
            return Some(Fragment::Attempt(attempt));
        }
        if let Some(task) = self.try_parse_task(&line) {
            return Some(Fragment::Task(task));
        }
        None
    }

    fn try_parse_job(&self, line: &str) -> Option<JobFragment> {
        let mut job = JobFragment::default();

        if let Some(caps) = self.job_line.captures(line) {
            job.job_id = Some(caps[1].to_string());
        } else if line.contains("USER=") {
            // línea suelta con USER= y un token de job embebido
            let found = self.job_id.find(line)?;
            job.job_id = Some(found.as_str().to_string());
        } else {
            return None;
        }

        for caps in self.parameter.captures_iter(line) {
            set_job_param(&mut job, &caps[1], &caps[2]);
        }

        Some(job)
    }

    fn try_parse_attempt(&self, line: &str) -> Option<AttemptFragment> {
        let caps = self.attempt_line.captures(line)?;

        let mut attempt = AttemptFragment {
            task_type: TaskType::parse(&caps[1].to_uppercase()),
            ..AttemptFragment::default()
        };

        for caps in self.parameter.captures_iter(line) {
            set_attempt_param(&mut attempt, &caps[1], &caps[2]);
        }

        for caps in self.counter.captures_iter(line) {
            if let Ok(value) = caps[2].parse::<i64>() {
                attempt.counters.insert(caps[1].to_string(), value);
            }
        }

        match attempt.task_id.as_deref() {
            Some(task_id) => {
                attempt.job_id = self.derive_job_id(task_id, line);
                Some(attempt)
            }
            None => {
                warn!("línea de attempt sin task id: {}", line);
                None
            }
        }
    }

    fn try_parse_task(&self, line: &str) -> Option<TaskFragment> {
        let caps = self.task_line.captures(line)?;

        let mut task = TaskFragment {
            task_type: TaskType::parse(&caps[2]),
            ..TaskFragment::default()
        };

        for caps in self.parameter.captures_iter(line) {
            set_task_param(&mut task, &caps[1], &caps[2]);
        }

        match task.task_id.as_deref() {
            Some(task_id) => {
                task.job_id = self.derive_job_id(task_id, line);
                Some(task)
            }
            None => {
                warn!("línea de task sin task id: {}", line);
                None
            }
        }
    }

    /// Reconstruye `job_<n>_<m>` a partir de `task_<n>_<m>_[mr]_<k>`.
    /// Si el task id no calza con la forma esperada, el fragmento queda
    /// sin job id y se descarta más adelante.
    fn derive_job_id(&self, task_id: &str, line: &str) -> Option<JobId> {
        match self.task_id.captures(task_id) {
            Some(caps) => Some(format!("job_{}", &caps[1])),
            None => {
                warn!("no pude derivar el job id de {} (línea: {})", task_id, line);
                None
            }
        }
    }
}

fn set_job_param(job: &mut JobFragment, name: &str, value: &str) {
    match name {
        "USER" => job.user = Some(value.to_string()),
        "JOBNAME" => job.job_name = Some(value.to_string()),
        "JOB_QUEUE" => job.job_queue = Some(value.to_string()),
        "JOB_STATUS" => {
            // sólo nos interesan los estados terminales
            if let Some(status) = JobStatus::parse(value) {
                job.job_status = Some(status);
            }
        }
        "SUBMIT_TIME" => set_millis(&mut job.submit_time, value),
        "LAUNCH_TIME" => set_millis(&mut job.launch_time, value),
        "FINISH_TIME" => set_millis(&mut job.finish_time, value),
        "TOTAL_MAPS" => set_count(&mut job.total_maps, value),
        "TOTAL_REDUCES" => set_count(&mut job.total_reduces, value),
        "FINISHED_MAPS" => set_count(&mut job.finished_maps, value),
        "FINISHED_REDUCES" => set_count(&mut job.finished_reduces, value),
        "FAILED_MAPS" => set_count(&mut job.failed_maps, value),
        "FAILED_REDUCES" => set_count(&mut job.failed_reduces, value),
        // cualquier otro nombre se ignora sin error
        _ => {}
    }
}

fn set_attempt_param(attempt: &mut AttemptFragment, name: &str, value: &str) {
    match name {
        "TASKID" => attempt.task_id = Some(value.to_string()),
        "TASK_ATTEMPT_ID" => attempt.task_attempt_id = Some(value.to_string()),
        "TASK_STATUS" => {
            if let Some(status) = TaskStatus::parse(value) {
                attempt.status = Some(status);
            }
        }
        "START_TIME" => set_millis(&mut attempt.start_time, value),
        "FINISH_TIME" => set_millis(&mut attempt.finish_time, value),
        "SHUFFLE_FINISHED" => set_millis(&mut attempt.shuffle_finished, value),
        "SORT_FINISHED" => set_millis(&mut attempt.sort_finished, value),
        _ => {}
    }
}

fn set_task_param(task: &mut TaskFragment, name: &str, value: &str) {
    match name {
        "TASKID" => task.task_id = Some(value.to_string()),
        "TASK_STATUS" => {
            if let Some(status) = TaskStatus::parse(value).filter(|s| s.is_task_terminal()) {
                task.status = Some(status);
            }
        }
        "START_TIME" => set_millis(&mut task.start_time, value),
        "FINISH_TIME" => set_millis(&mut task.finish_time, value),
        _ => {}
    }
}

fn set_millis(field: &mut Option<i64>, value: &str) {
    if let Ok(parsed) = value.parse::<i64>() {
        *field = Some(parsed);
    }
}

fn set_count(field: &mut Option<i32>, value: &str) {
    if let Ok(parsed) = value.parse::<i32>() {
        *field = Some(parsed);
    }
}
