use anyhow::{anyhow, bail};
use clap::Parser;
use common::{protocol::MAX_BLOCK_LEN, DEFAULT_BLOCK_SIZE};
use std::{path::PathBuf, time::Duration};

/// Máximo de jobs corriendo a la vez si no se configura otra cosa.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;

/// Espera máxima del loop del controller entre ciclos.
pub const DEFAULT_QUEUE_WAIT_MS: u64 = 500;

/// Configuración del binario `master`.
///
/// Todo se puede pasar por argumento o por variable de entorno.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "master",
    version,
    about = "Motor de jobs de métricas: lee requests JSON por stdin y escribe respuestas por stdout"
)]
pub struct CliArgs {
    /// Jobs en RUNNING como máximo. Los demás esperan en PENDING.
    ///
    /// Variable de entorno: `MAX_CONCURRENT_JOBS`
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value_t = DEFAULT_MAX_CONCURRENT_JOBS)]
    pub max_concurrent_jobs: usize,

    /// Milisegundos entre ticks del controller (también marca cada cuánto
    /// se revisan los deadlines).
    ///
    /// Variable de entorno: `QUEUE_WAIT_MS`
    #[arg(long, env = "QUEUE_WAIT_MS", default_value_t = DEFAULT_QUEUE_WAIT_MS)]
    pub queue_wait_ms: u64,

    /// Tamaño de bloque del stream worker -> controller, en bytes.
    ///
    /// Variable de entorno: `BLOCK_SIZE`
    #[arg(long, env = "BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,

    /// Segundos antes de matar a un worker. Sin valor no hay límite.
    ///
    /// Variable de entorno: `JOB_DEADLINE_SECS`
    #[arg(long, env = "JOB_DEADLINE_SECS")]
    pub job_deadline_secs: Option<u64>,

    /// Binario del worker. Por defecto, `worker` al lado de este ejecutable.
    ///
    /// Variable de entorno: `WORKER_BIN`
    #[arg(long, env = "WORKER_BIN")]
    pub worker_bin: Option<PathBuf>,

    /// Variable de entorno: `DATA_DIR`
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Corre los workers dentro del proceso en vez de lanzar procesos.
    ///
    /// Variable de entorno: `INLINE`
    #[arg(long, env = "INLINE", default_value_t = false)]
    pub inline: bool,
}

/// Parámetros del loop del controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_concurrent_jobs: usize,
    pub queue_wait: Duration,
    pub block_size: usize,
    pub job_deadline: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            queue_wait: Duration::from_millis(DEFAULT_QUEUE_WAIT_MS),
            block_size: DEFAULT_BLOCK_SIZE,
            job_deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchMode {
    Process { worker_bin: PathBuf, data_dir: PathBuf },
    Inline { data_dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub controller: ControllerConfig,
    pub launch: LaunchMode,
}

impl TryFrom<CliArgs> for MasterConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_concurrent_jobs == 0 {
            bail!("MAX_CONCURRENT_JOBS tiene que ser mayor que 0");
        }
        if args.queue_wait_ms == 0 {
            bail!("QUEUE_WAIT_MS tiene que ser mayor que 0");
        }
        if args.block_size == 0 || args.block_size > MAX_BLOCK_LEN {
            bail!(
                "BLOCK_SIZE ({}) fuera de rango (1..={})",
                args.block_size,
                MAX_BLOCK_LEN
            );
        }
        if args.job_deadline_secs == Some(0) {
            bail!("JOB_DEADLINE_SECS tiene que ser mayor que 0");
        }

        let launch = if args.inline {
            LaunchMode::Inline {
                data_dir: args.data_dir,
            }
        } else {
            let worker_bin = match args.worker_bin {
                Some(path) => path,
                None => std::env::current_exe()
                    .map_err(|e| anyhow!("no se pudo ubicar el ejecutable actual: {e}"))?
                    .with_file_name(format!("worker{}", std::env::consts::EXE_SUFFIX)),
            };
            LaunchMode::Process {
                worker_bin,
                data_dir: args.data_dir,
            }
        };

        Ok(Self {
            controller: ControllerConfig {
                max_concurrent_jobs: args.max_concurrent_jobs,
                queue_wait: Duration::from_millis(args.queue_wait_ms),
                block_size: args.block_size,
                job_deadline: args.job_deadline_secs.map(Duration::from_secs),
            },
            launch,
        })
    }
}
