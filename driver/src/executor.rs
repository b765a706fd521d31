use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/* --------- Máquina de estados de un job --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

// un estado terminal nunca se pisa
fn set_state(state: &Arc<Mutex<JobState>>, new: JobState) {
    let mut current = state.lock().unwrap();
    if !current.is_terminal() {
        *current = new;
    }
}

/* --------- Job con salida en staging --------- */

/// Unidad de trabajo con publicación atómica: escribe toda su salida en un
/// directorio de staging único y, sólo si terminó bien, borra la salida
/// final anterior y renombra el staging encima. Un job que falla o se
/// interrumpe nunca deja una salida buena a medio pisar.
pub struct StagedJob {
    name: String,
    staging_dir: PathBuf,
    output_path: PathBuf,
    work: Box<dyn FnOnce(&Path) -> Result<()> + Send + 'static>,
}

impl StagedJob {
    pub fn new(
        name: impl Into<String>,
        staging_root: &Path,
        output_path: impl Into<PathBuf>,
        work: impl FnOnce(&Path) -> Result<()> + Send + 'static,
    ) -> Self {
        // los nanos hacen único el staging entre corridas y entre jobs
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Self {
            name: name.into(),
            staging_dir: staging_root.join(nanos.to_string()).join("staged"),
            output_path: output_path.into(),
            work: Box::new(work),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run(self, state: &Mutex<JobState>) -> Result<()> {
        // work es FnOnce: se desarma self de una vez
        let StagedJob {
            name,
            staging_dir,
            output_path,
            work,
        } = self;

        fs::create_dir_all(&staging_dir).with_context(|| {
            format!("no se pudo crear el staging {}", staging_dir.display())
        })?;

        info!("job {} escribiendo en staging {}", name, staging_dir.display());

        match work(&staging_dir) {
            // un job cancelado mientras corría no llega a publicar
            Ok(()) if state.lock().unwrap().is_terminal() => {
                let _ = fs::remove_dir_all(&staging_dir);
                bail!("el job {} fue cancelado antes de publicar", name)
            }
            Ok(()) => publish(&name, &staging_dir, &output_path),
            Err(e) => {
                // staging huérfano: se limpia lo mejor que se pueda
                let _ = fs::remove_dir_all(&staging_dir);
                Err(e.context(format!("falló el job {}", name)))
            }
        }
    }
}

fn publish(name: &str, staging_dir: &Path, output_path: &Path) -> Result<()> {
    if output_path.exists() {
        if output_path.is_dir() {
            fs::remove_dir_all(output_path)
        } else {
            fs::remove_file(output_path)
        }
        .with_context(|| {
            format!("no se pudo borrar la salida vieja {}", output_path.display())
        })?;
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::rename(staging_dir, output_path).with_context(|| {
        format!(
            "no se pudo publicar {} sobre {}",
            staging_dir.display(),
            output_path.display()
        )
    })?;

    // el directorio de nanos queda vacío después del rename
    if let Some(parent) = staging_dir.parent() {
        let _ = fs::remove_dir(parent);
    }

    info!("job {} publicado en {}", name, output_path.display());
    Ok(())
}

/* --------- Ejecutor con concurrencia acotada y fail-fast --------- */

/// Handle para observar el estado de un job ya entregado al ejecutor.
#[derive(Clone)]
pub struct JobTicket {
    name: String,
    state: Arc<Mutex<JobState>>,
}

impl JobTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }
}

struct TrackedJob {
    name: String,
    state: Arc<Mutex<JobState>>,
    handle: JoinHandle<()>,
}

/// Corre hasta N jobs a la vez. `submit` encola sin bloquear; el job
/// arranca cuando se libera un lugar. `wait_for_batch` espera a que todos
/// los jobs entregados terminen, y ante la primera falla observada cancela
/// al resto del batch en vez de esperarlos.
pub struct StagedJobExecutor {
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    accepting: Mutex<bool>,
    batch: Mutex<Vec<TrackedJob>>,
}

impl StagedJobExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            poll_interval: DEFAULT_POLL_INTERVAL,
            accepting: Mutex::new(true),
            batch: Mutex::new(Vec::new()),
        }
    }

    /// Intervalo de sondeo más corto, para los tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn submit(&self, job: StagedJob) -> Result<JobTicket> {
        if !*self.accepting.lock().unwrap() {
            bail!("el ejecutor ya no acepta trabajos");
        }

        let name = job.name().to_string();
        let state = Arc::new(Mutex::new(JobState::Submitted));

        let task_name = name.clone();
        let task_state = state.clone();
        let semaphore = self.semaphore.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                // el semáforo se cerró durante el drenaje
                set_state(&task_state, JobState::Cancelled);
                return;
            };

            if task_state.lock().unwrap().is_terminal() {
                return;
            }
            set_state(&task_state, JobState::Running);
            info!("job {} arrancó", task_name);

            let run_state = task_state.clone();
            match tokio::task::spawn_blocking(move || job.run(&run_state)).await {
                Ok(Ok(())) => set_state(&task_state, JobState::Succeeded),
                Ok(Err(e)) => {
                    error!("job {} falló: {:#}", task_name, e);
                    set_state(&task_state, JobState::Failed);
                }
                Err(e) => {
                    error!("job {} abortó de forma anormal: {}", task_name, e);
                    set_state(&task_state, JobState::Failed);
                }
            }
        });

        self.batch.lock().unwrap().push(TrackedJob {
            name: name.clone(),
            state: state.clone(),
            handle,
        });

        Ok(JobTicket { name, state })
    }

    /// Espera a que todo el batch llegue a un estado terminal, sondeando.
    /// Fail-fast: la primera falla cancela al resto y devuelve error.
    /// El batch queda vacío al salir, por cualquiera de los dos caminos.
    pub async fn wait_for_batch(&self) -> Result<()> {
        loop {
            let (all_terminal, failed) = {
                let batch = self.batch.lock().unwrap();
                let failed: Vec<String> = batch
                    .iter()
                    .filter(|j| *j.state.lock().unwrap() == JobState::Failed)
                    .map(|j| j.name.clone())
                    .collect();
                let all_terminal = batch
                    .iter()
                    .all(|j| j.state.lock().unwrap().is_terminal());
                (all_terminal, failed)
            };

            if !failed.is_empty() {
                self.cancel_all();
                self.batch.lock().unwrap().clear();
                bail!(
                    "falló {}; el resto del batch fue cancelado",
                    failed.join(", ")
                );
            }

            if all_terminal {
                self.batch.lock().unwrap().clear();
                return Ok(());
            }

            sleep(self.poll_interval).await;
        }
    }

    /// Corta todo lo que esté corriendo o encolado, a mejor esfuerzo.
    /// No espera: los estados quedan en Cancelled y los handles abortados.
    pub fn cancel_all(&self) {
        let batch = self.batch.lock().unwrap();
        for job in batch.iter() {
            job.handle.abort();
            let mut state = job.state.lock().unwrap();
            if !state.is_terminal() {
                warn!("job {} cancelado", job.name);
                *state = JobState::Cancelled;
            }
        }
    }

    /// Como `wait_for_batch`, pero además deja de aceptar trabajos nuevos
    /// y libera los lugares de los workers, pase lo que pase.
    pub async fn drain_and_shutdown(&self) -> Result<()> {
        *self.accepting.lock().unwrap() = false;
        let result = self.wait_for_batch().await;
        self.semaphore.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
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

    fn test_executor(concurrency: usize) -> StagedJobExecutor {
        StagedJobExecutor::new(concurrency).with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn un_job_exitoso_publica_su_salida() {
        let tmp = fresh_dir("exec_ok");
        let staging = tmp.join("staging");
        let output = tmp.join("salida").join("jobs");

        let executor = test_executor(2);
        let job = StagedJob::new("parse-grid", &staging, &output, |dir: &Path| {
            fs::write(dir.join("part-0.jsonl"), b"{}\n")?;
            Ok(())
        });

        let ticket = executor.submit(job).unwrap();
        executor.wait_for_batch().await.unwrap();

        assert_eq!(ticket.state(), JobState::Succeeded);
        assert!(output.join("part-0.jsonl").exists());

        // el staging no deja directorios huérfanos
        let leftovers = fs::read_dir(&staging).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn la_publicacion_reemplaza_la_salida_anterior() {
        let tmp = fresh_dir("exec_replace");
        let staging = tmp.join("staging");
        let output = tmp.join("salida");

        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("viejo.txt"), b"viejo").unwrap();

        let executor = test_executor(1);
        let job = StagedJob::new("reproceso", &staging, &output, |dir: &Path| {
            fs::write(dir.join("nuevo.txt"), b"nuevo")?;
            Ok(())
        });

        executor.submit(job).unwrap();
        executor.wait_for_batch().await.unwrap();

        assert!(output.join("nuevo.txt").exists());
        assert!(!output.join("viejo.txt").exists());
    }

    #[tokio::test]
    async fn un_fallo_no_toca_la_salida_existente() {
        let tmp = fresh_dir("exec_fail");
        let staging = tmp.join("staging");
        let output = tmp.join("salida");

        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("bueno.txt"), b"bueno").unwrap();

        let executor = test_executor(1);
        let job = StagedJob::new("roto", &staging, &output, |dir: &Path| {
            fs::write(dir.join("basura.txt"), b"x")?;
            Err(anyhow!("algo salió mal"))
        });

        let ticket = executor.submit(job).unwrap();
        let result = executor.wait_for_batch().await;

        assert!(result.is_err());
        assert_eq!(ticket.state(), JobState::Failed);
        // la salida buena sigue intacta y el staging se limpió
        assert!(output.join("bueno.txt").exists());
        assert!(!output.join("basura.txt").exists());
    }

    #[tokio::test]
    async fn un_fallo_cancela_al_resto_del_batch() {
        let tmp = fresh_dir("exec_failfast");
        let staging = tmp.join("staging");

        let executor = test_executor(2);

        let lento_a = StagedJob::new("lento-a", &staging, tmp.join("salida_a"), |dir: &Path| {
            std::thread::sleep(Duration::from_millis(300));
            fs::write(dir.join("tarde.txt"), b"x")?;
            Ok(())
        });
        let falla = StagedJob::new("falla", &staging, tmp.join("salida_b"), |_: &Path| {
            std::thread::sleep(Duration::from_millis(30));
            Err(anyhow!("boom"))
        });
        let lento_c = StagedJob::new("lento-c", &staging, tmp.join("salida_c"), |dir: &Path| {
            std::thread::sleep(Duration::from_millis(300));
            fs::write(dir.join("tarde.txt"), b"x")?;
            Ok(())
        });

        let ticket_a = executor.submit(lento_a).unwrap();
        executor.submit(falla).unwrap();
        let ticket_c = executor.submit(lento_c).unwrap();

        let result = executor.wait_for_batch().await;

        assert!(result.is_err());
        assert_eq!(ticket_a.state(), JobState::Cancelled);
        assert_eq!(ticket_c.state(), JobState::Cancelled);
        // las salidas de los jobs cancelados nunca se publicaron
        assert!(!tmp.join("salida_a").exists());
        assert!(!tmp.join("salida_c").exists());
    }

    #[tokio::test]
    async fn despues_del_drenaje_no_se_aceptan_trabajos() {
        let tmp = fresh_dir("exec_drain");
        let staging = tmp.join("staging");

        let executor = test_executor(1);
        executor.drain_and_shutdown().await.unwrap();

        let job = StagedJob::new("tarde", &staging, tmp.join("salida"), |_: &Path| Ok(()));
        assert!(executor.submit(job).is_err());
    }

    #[tokio::test]
    async fn los_estados_terminales_no_se_pisan() {
        let state = Arc::new(Mutex::new(JobState::Running));
        set_state(&state, JobState::Failed);
        set_state(&state, JobState::Succeeded);
        assert_eq!(*state.lock().unwrap(), JobState::Failed);

        let state = Arc::new(Mutex::new(JobState::Submitted));
        set_state(&state, JobState::Cancelled);
        set_state(&state, JobState::Running);
        assert_eq!(*state.lock().unwrap(), JobState::Cancelled);
    }
}
