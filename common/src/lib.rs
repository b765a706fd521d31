use std::collections::BTreeMap;
use tracing::info;

pub mod engine;
pub mod merge;
pub mod parsing;
pub mod planner;
pub mod usage;

pub type JobId = String;
pub type TaskId = String;
pub type TaskAttemptId = String;

/* --------- Nombres de contadores de los logs que nos interesan --------- */

pub const CPU_MILLISECONDS: &str = "CPU_MILLISECONDS";
pub const SPILLED_RECORDS: &str = "SPILLED_RECORDS";
pub const REDUCE_SHUFFLE_BYTES: &str = "REDUCE_SHUFFLE_BYTES";

/// Sink de diagnósticos inyectado en los componentes del pipeline.
/// Los logs vienen truncados con frecuencia, así que los datos descartados
/// se cuentan aquí en vez de tratarse como errores.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    counters: BTreeMap<String, u64>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Vuelca los contadores acumulados al log.
    pub fn report(&self, context: &str) {
        for (name, value) in &self.counters {
            info!("diagnóstico [{}] {}: {}", context, name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_acumula_contadores_por_nombre() {
        let mut diag = Diagnostics::new();
        assert!(diag.is_empty());

        diag.add("intento sin status");
        diag.add("intento sin status");
        diag.add("job inconsistente");

        assert_eq!(diag.count("intento sin status"), 2);
        assert_eq!(diag.count("job inconsistente"), 1);
        assert_eq!(diag.count("no existe"), 0);
    }
}
