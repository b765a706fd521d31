use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

/// Pipeline de uso de cluster: parsea historiales de jobs y mantiene
/// la tabla de uso por hora, día por día y de forma incremental.
#[derive(Debug, Parser)]
#[command(name = "driver")]
#[command(about = "Procesa historiales de jobs y calcula el uso por hora")]
pub struct Config {
    /// Clusters a procesar, separados por coma
    #[arg(long, value_delimiter = ',')]
    pub clusters: Vec<String>,

    /// Raíz de los logs de historia (<raíz>/<cluster>/<yyyy>/<MMdd>/*.log)
    #[arg(long)]
    pub logs_root: PathBuf,

    /// Raíz de salida de los jobs mergeados
    #[arg(long)]
    pub jobs_root: PathBuf,

    /// Raíz de salida de la tabla de uso por hora
    #[arg(long)]
    pub usage_root: PathBuf,

    /// Directorio de staging para la publicación atómica
    #[arg(long)]
    pub staging_root: PathBuf,

    /// Cuántos días hacia atrás considerar
    #[arg(long, default_value_t = 30)]
    pub num_days: u32,

    /// Días recientes que se reprocesan siempre, tengan salida o no
    #[arg(long, default_value_t = 2)]
    pub num_days_forced: u32,

    /// Saltear los días que ya tienen salida (fuera de los forzados)
    #[arg(long)]
    pub incremental: bool,

    /// Cuántos jobs corren a la vez
    #[arg(long, default_value_t = 2)]
    pub concurrency: usize,
}

impl Config {
    /// Los errores de configuración son fatales antes de entregar
    /// cualquier trabajo al ejecutor.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("hay que indicar al menos un cluster");
        }
        if self.clusters.iter().any(|c| c.trim().is_empty()) {
            bail!("la lista de clusters tiene un nombre vacío");
        }
        if self.num_days == 0 {
            bail!("num-days tiene que ser al menos 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency tiene que ser al menos 1");
        }
        if !self.logs_root.is_dir() {
            bail!("la raíz de logs {} no existe", self.logs_root.display());
        }
        Ok(())
    }
}
