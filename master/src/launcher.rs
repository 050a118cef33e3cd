//! Cómo se levanta un worker para un job.
//!
//! El controller no sabe si el worker es un proceso o una tarea: recibe un
//! `WorkerHandle` con el lado de lectura del stream y algo que se puede
//! esperar o terminar.

use common::{JobId, MetricsBackend, RequestDescriptor};
use std::{path::PathBuf, pin::Pin, process::Stdio};
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

pub type WorkerOutput = Pin<Box<dyn AsyncRead + Send>>;

pub enum WorkerExit {
    Process(Child),
    /// Worker en proceso; devuelve `false` si terminó con error.
    Task(JoinHandle<bool>),
}

impl WorkerExit {
    /// Espera a que termine. `true` sólo si salió normalmente.
    pub async fn wait(&mut self) -> bool {
        match self {
            WorkerExit::Process(child) => match child.wait().await {
                Ok(status) => {
                    if !status.success() {
                        debug!("worker {:?} salió con {}", child.id(), status);
                    }
                    status.success()
                }
                Err(e) => {
                    warn!("no se pudo esperar al worker: {}", e);
                    false
                }
            },
            WorkerExit::Task(handle) => match handle.await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("worker en proceso terminó mal: {}", e);
                    false
                }
            },
        }
    }

    /// Mata al worker. Las tareas bloqueantes no se pueden abortar: terminan
    /// cuando se cierra el lado de lectura de su pipe.
    pub async fn terminate(&mut self) {
        match self {
            WorkerExit::Process(child) => {
                if let Err(e) = child.kill().await {
                    warn!("no se pudo matar al worker {:?}: {}", child.id(), e);
                }
            }
            WorkerExit::Task(handle) => handle.abort(),
        }
    }
}

pub struct WorkerHandle {
    pub output: WorkerOutput,
    pub exit: WorkerExit,
}

impl WorkerHandle {
    pub fn from_task(output: impl AsyncRead + Send + 'static, task: JoinHandle<bool>) -> Self {
        Self {
            output: Box::pin(output),
            exit: WorkerExit::Task(task),
        }
    }
}

pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, job_id: JobId, request: &RequestDescriptor) -> common::Result<WorkerHandle>;
}

/// Un proceso `worker` por job; el request va por argumento y el resultado
/// vuelve por stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub worker_bin: PathBuf,
    pub data_dir: PathBuf,
    pub block_size: usize,
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job_id: JobId, request: &RequestDescriptor) -> common::Result<WorkerHandle> {
        let payload = serde_json::to_string(request)?;

        let mut child = Command::new(&self.worker_bin)
            .arg("--request")
            .arg(payload)
            .arg("--data-dir")
            .arg(&self.data_dir)
            .arg("--block-size")
            .arg(self.block_size.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| common::Error::protocol("el worker no tiene stdout"))?;

        debug!("job {} -> worker pid {:?}", job_id, child.id());
        Ok(WorkerHandle {
            output: Box::pin(stdout),
            exit: WorkerExit::Process(child),
        })
    }
}

/// Corre el pipeline del worker en un thread bloqueante, escribiendo en un
/// pipe en memoria del mismo tamaño que un bloque.
#[derive(Clone)]
pub struct InlineLauncher {
    pub backend: MetricsBackend,
    pub block_size: usize,
}

impl WorkerLauncher for InlineLauncher {
    fn launch(&self, job_id: JobId, request: &RequestDescriptor) -> common::Result<WorkerHandle> {
        let (reader, writer) = tokio::io::duplex(self.block_size);
        let mut out = SyncIoBridge::new(writer);

        let backend = self.backend.clone();
        let request = request.clone();
        let block_size = self.block_size;

        let task = tokio::task::spawn_blocking(move || {
            match common::worker::run(&request, &backend, &mut out, block_size) {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("worker en proceso del job {} falló: {}", job_id, e);
                    false
                }
            }
        });

        Ok(WorkerHandle::from_task(reader, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{protocol::read_message, WorkerMessage};

    fn backend() -> MetricsBackend {
        let users = "user_id,registered\n42,20240101\n";
        let edits = "user_id,timestamp,bytes\n42,20240101100000,10\n42,20240101110000,5\n";
        let cohorts = "cohort,user_id\nsolo,42\n";
        let dataset =
            common::dataset::CsvDataset::from_readers(users.as_bytes(), edits.as_bytes(), cohorts.as_bytes())
                .unwrap();
        MetricsBackend::from_dataset(dataset)
    }

    #[tokio::test]
    async fn inline_escribe_por_el_pipe() {
        let launcher = InlineLauncher {
            backend: backend(),
            block_size: 16,
        };
        let mut req = RequestDescriptor::new("solo", "edit_count");
        req.date_start = Some("20240101".to_string());
        req.date_end = Some("20240102".to_string());

        let mut handle = launcher.launch(1, &req).unwrap();
        let message = read_message(&mut handle.output).await.unwrap();

        let WorkerMessage::Response(resp) = &message else {
            panic!("se esperaba respuesta, vino {message:?}");
        };
        let value = serde_json::to_value(resp).unwrap();
        assert_eq!(value["data"], serde_json::json!({"42": [2]}));
        assert!(handle.exit.wait().await);
    }

    #[tokio::test]
    async fn inline_con_cohorte_desconocida_sale_con_error() {
        let launcher = InlineLauncher {
            backend: backend(),
            block_size: 16,
        };
        let req = RequestDescriptor::new("fantasma", "edit_count");

        let mut handle = launcher.launch(2, &req).unwrap();
        let message = read_message(&mut handle.output).await.unwrap();

        assert!(matches!(message, WorkerMessage::Failure(_)));
        assert!(!handle.exit.wait().await);
    }

    #[tokio::test]
    async fn proceso_inexistente_no_se_lanza() {
        let launcher = ProcessLauncher {
            worker_bin: PathBuf::from("/no/existe/worker"),
            data_dir: PathBuf::from("data"),
            block_size: 64,
        };
        let req = RequestDescriptor::new("42", "edit_count");

        assert!(launcher.launch(3, &req).is_err());
    }
}
