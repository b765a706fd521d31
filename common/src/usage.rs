use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::merge::MergedAttempt;
use crate::{Diagnostics, CPU_MILLISECONDS, REDUCE_SHUFFLE_BYTES, SPILLED_RECORDS};
use crate::parsing::{TaskStatus, TaskType};

const HOUR_MILLIS: i64 = 3_600_000;

/* --------- Clave y valor de los registros de uso por hora --------- */

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Hours,
}

impl TimeUnit {
    pub fn to_millis(self) -> i64 {
        match self {
            TimeUnit::Hours => HOUR_MILLIS,
        }
    }
}

/// Clave de agrupación de los buckets. Todo el pipeline trabaja en GMT,
/// así que el piso de hora es aritmética de módulo, sin calendario.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub cluster: String,
    pub user: Option<String>,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub excess: bool,
    pub unit: TimeUnit,
    /// Instante de inicio del bucket, en millis GMT alineados a la hora.
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageValue {
    pub elapsed_minutes: f64,
    pub cpu_minutes: Option<f64>,
    pub spilled_records: Option<i64>,
    /// No se prorratea: cada bucket lleva el contador completo.
    /// TODO: confirmar con producto si debería prorratearse como los demás.
    pub reduce_shuffle_bytes: Option<i64>,
    pub started: i64,
    pub finished: i64,
}

/// Piso de hora en millis. rem_euclid para que los instantes anteriores
/// a epoch también caigan en el bucket correcto.
pub fn hour_floor(millis: i64) -> i64 {
    millis - millis.rem_euclid(HOUR_MILLIS)
}

/* --------- Bucketing de un attempt --------- */

/// Parte el intervalo activo de un attempt en buckets horarios, con las
/// métricas prorrateadas por la fracción del intervalo que cae en cada uno.
/// Los attempts sin tiempos utilizables no aportan buckets; se cuentan.
pub fn bucket_attempt(
    cluster: &str,
    user: Option<&str>,
    attempt: &MergedAttempt,
    diag: &mut Diagnostics,
) -> Vec<(UsageKey, UsageValue)> {
    let (Some(start), Some(finish)) = (attempt.start_time, attempt.finish_time) else {
        diag.add("attempt sin start o finish");
        return Vec::new();
    };

    if start <= 0 || finish <= 0 {
        diag.add("attempt con start o finish no positivo");
        return Vec::new();
    }

    // duración cero: no hay nada que repartir
    if finish == start {
        return Vec::new();
    }

    let total = (finish - start) as f64;
    let cpu = attempt.counters.get(CPU_MILLISECONDS).copied();
    let spilled = attempt.counters.get(SPILLED_RECORDS).copied();
    let shuffle = attempt.counters.get(REDUCE_SHUFFLE_BYTES).copied();

    let mut buckets = Vec::new();
    let mut cursor = start;

    while cursor < finish {
        let bucket_start = hour_floor(cursor);
        let bucket_end = (bucket_start + HOUR_MILLIS).min(finish);
        let frac = (bucket_end - cursor) as f64 / total;

        let key = UsageKey {
            cluster: cluster.to_string(),
            user: user.map(str::to_string),
            status: attempt.status,
            task_type: attempt.task_type,
            excess: attempt.derived.excess,
            unit: TimeUnit::Hours,
            time: bucket_start,
        };

        let mut value = UsageValue {
            elapsed_minutes: (bucket_end - cursor) as f64 / 1000.0 / 60.0,
            cpu_minutes: cpu.map(|c| frac * c as f64 / 1000.0 / 60.0),
            spilled_records: spilled.map(|s| (frac * s as f64).round() as i64),
            reduce_shuffle_bytes: shuffle,
            started: 0,
            finished: 0,
        };

        // bordes inclusivos: un instante justo en la frontera de hora
        // cuenta en el bucket que termina ahí, no se pierde
        if bucket_start <= start && start <= bucket_start + HOUR_MILLIS {
            value.started = 1;
        }
        if bucket_start <= finish && finish <= bucket_start + HOUR_MILLIS {
            value.finished = 1;
        }

        buckets.push((key, value));
        cursor = bucket_end;
    }

    buckets
}

/* --------- Agregación por clave --------- */

/// Suma registros de bucket que comparten clave. Las métricas opcionales
/// se siembran con la primera presencia: ausente + ausente sigue ausente.
#[derive(Debug, Default)]
pub struct UsageAggregator {
    acc: BTreeMap<UsageKey, UsageValue>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: UsageKey, value: UsageValue) {
        let merged = self.acc.entry(key).or_default();

        merged.elapsed_minutes += value.elapsed_minutes;
        merged.started += value.started;
        merged.finished += value.finished;
        merged.cpu_minutes = sum_opt(merged.cpu_minutes, value.cpu_minutes);
        merged.spilled_records = sum_opt(merged.spilled_records, value.spilled_records);
        merged.reduce_shuffle_bytes =
            sum_opt(merged.reduce_shuffle_bytes, value.reduce_shuffle_bytes);
    }

    pub fn len(&self) -> usize {
        self.acc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acc.is_empty()
    }

    /// Consumir el acumulador, en orden de clave.
    pub fn into_sorted(self) -> Vec<(UsageKey, UsageValue)> {
        self.acc.into_iter().collect()
    }
}

fn sum_opt<T: std::ops::Add<Output = T>>(acc: Option<T>, seen: Option<T>) -> Option<T> {
    match (acc, seen) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
