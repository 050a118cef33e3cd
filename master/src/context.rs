//! Contexto explícito del motor: arranca el controller en su propia tarea
//! y expone admisión, estadísticas y parada.

use common::{JobId, JobResponse, RequestDescriptor};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::controller::{JobController, JobSubmitter};
use crate::launcher::WorkerLauncher;
use crate::state::ControllerStats;

pub struct EngineContext {
    submitter: JobSubmitter,
    stats: watch::Receiver<ControllerStats>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl EngineContext {
    /// Arranca el controller. Devuelve el contexto y el canal de respuestas.
    pub fn start(
        config: ControllerConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> (Self, mpsc::UnboundedReceiver<JobResponse>) {
        let shutdown = CancellationToken::new();
        let (controller, handles) = JobController::new(config, launcher, shutdown.clone());
        let task = tokio::spawn(controller.run());

        let context = Self {
            submitter: handles.submitter,
            stats: handles.stats,
            shutdown,
            task,
        };
        (context, handles.responses)
    }

    pub fn submit(&self, request: RequestDescriptor) -> common::Result<JobId> {
        self.submitter.submit(request)
    }

    /// Otro productor para el canal de admisión.
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    pub fn stats(&self) -> ControllerStats {
        *self.stats.borrow()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Corta ya: mata los workers, descarta pendientes y espera al controller.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Cierra la admisión y espera a que terminen los jobs ya admitidos.
    /// Los `JobSubmitter` clonados tienen que haberse soltado.
    pub async fn drain(self) {
        info!("cerrando admisión, esperando {:?}", self.stats());
        self.join().await;
    }

    async fn join(self) {
        let Self {
            submitter, task, ..
        } = self;
        drop(submitter);

        if let Err(e) = task.await {
            warn!("la tarea del controller terminó mal: {}", e);
        }
    }
}
