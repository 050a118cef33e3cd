//! Controller de jobs.
//!
//! Una sola tarea dueña de todo el estado. Cada ciclo espera un evento
//! (apagado, un job terminado, una admisión o el tick), barre los
//! terminados que ya estén en cola y después admite pendientes mientras
//! haya lugar bajo el techo de concurrencia.

use common::{
    protocol::read_message, Error, Job, JobId, JobOutcome, JobResponse, JobStatus, RequestDescriptor,
    ResponseRecord, WorkerMessage,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::launcher::{WorkerHandle, WorkerLauncher};
use crate::monitor;
use crate::state::{ControllerStats, InFlight, JobTable};

/// Lo que reporta la tarea que drena a un worker.
#[derive(Debug)]
pub struct Completion {
    pub job_id: JobId,
    pub result: Result<ResponseRecord, String>,
}

/// Lado de admisión. Se puede clonar; el controller deja de esperar
/// admisiones cuando se sueltan todos los clones.
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    tx: mpsc::UnboundedSender<Job>,
    next_id: Arc<AtomicU64>,
}

impl JobSubmitter {
    /// Encola sin bloquear. El id queda asignado acá.
    pub fn submit(&self, request: RequestDescriptor) -> common::Result<JobId> {
        request.validate()?;

        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.tx
            .send(Job::new(job_id, request))
            .map_err(|_| Error::ControllerStopped)?;
        Ok(job_id)
    }
}

/// Extremos de los canales que quedan del lado del que usa el controller.
pub struct ControllerHandles {
    pub submitter: JobSubmitter,
    pub responses: mpsc::UnboundedReceiver<JobResponse>,
    pub stats: watch::Receiver<ControllerStats>,
}

pub struct JobController {
    config: ControllerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    table: JobTable,

    admissions: mpsc::UnboundedReceiver<Job>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    responses: mpsc::UnboundedSender<JobResponse>,
    stats: watch::Sender<ControllerStats>,
    shutdown: CancellationToken,
}

impl JobController {
    pub fn new(
        config: ControllerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        shutdown: CancellationToken,
    ) -> (Self, ControllerHandles) {
        let (admit_tx, admit_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(ControllerStats::default());

        let controller = Self {
            config,
            launcher,
            table: JobTable::new(),
            admissions: admit_rx,
            completions_tx,
            completions_rx,
            responses: responses_tx,
            stats: stats_tx,
            shutdown,
        };
        let handles = ControllerHandles {
            submitter: JobSubmitter {
                tx: admit_tx,
                next_id: Arc::new(AtomicU64::new(0)),
            },
            responses: responses_rx,
            stats: stats_rx,
        };
        (controller, handles)
    }

    /// Loop principal. Termina al cancelar `shutdown`, o cuando se cerró la
    /// admisión y no queda nada pendiente ni corriendo.
    pub async fn run(mut self) {
        info!(
            "controller iniciado: max_concurrent_jobs={} queue_wait={:?} deadline={:?}",
            self.config.max_concurrent_jobs, self.config.queue_wait, self.config.job_deadline
        );

        let mut tick = tokio::time::interval(self.config.queue_wait);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut admissions_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("apagando controller");
                    break;
                }
                Some(done) = self.completions_rx.recv() => self.complete(done),
                job = self.admissions.recv(), if admissions_open => match job {
                    Some(job) => self.admit(job),
                    None => {
                        debug!("canal de admisión cerrado");
                        admissions_open = false;
                    }
                },
                _ = tick.tick() => monitor::enforce_deadlines(&mut self.table, Instant::now()),
            }

            // barrido de terminados
            while let Ok(done) = self.completions_rx.try_recv() {
                self.complete(done);
            }

            // barrido de admisión
            self.dispatch();

            self.stats.send_replace(self.table.stats());

            if !admissions_open && self.table.is_idle() {
                info!("sin admisiones ni jobs en curso, controller terminado");
                break;
            }
        }

        self.abort_in_flight().await;
    }

    fn admit(&mut self, job: Job) {
        debug!(
            "job {} admitido como PENDING ({} sobre '{}')",
            job.id, job.request.metric, job.request.cohort_expr
        );
        self.table.enqueue(job);
    }

    fn dispatch(&mut self) {
        while self.table.running() < self.config.max_concurrent_jobs {
            let Some(mut job) = self.table.pending.pop_front() else {
                break;
            };

            if let Err(e) = job.transition(JobStatus::Running) {
                warn!("job {} no se puede lanzar: {}", job.id, e);
                continue;
            }

            match self.launcher.launch(job.id, &job.request) {
                Ok(handle) => {
                    let cancel = self.shutdown.child_token();
                    let drain = tokio::spawn(drain_worker(
                        job.id,
                        handle,
                        cancel.clone(),
                        self.completions_tx.clone(),
                    ));

                    info!(
                        "job {} en RUNNING ({} corriendo, {} pendientes)",
                        job.id,
                        self.table.running() + 1,
                        self.table.pending.len()
                    );
                    self.table.in_flight.insert(
                        job.id,
                        InFlight {
                            deadline: self.config.job_deadline.map(|d| Instant::now() + d),
                            expired: false,
                            job,
                            cancel,
                            drain,
                        },
                    );
                }
                Err(e) => {
                    warn!("no se pudo lanzar el worker del job {}: {}", job.id, e);
                    self.finish(job, Err(format!("no se pudo lanzar el worker: {e}")));
                }
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        let Some(flight) = self.table.in_flight.remove(&done.job_id) else {
            warn!("terminó el job {} pero no estaba en vuelo", done.job_id);
            return;
        };

        let result = match done.result {
            Err(_) if flight.expired => Err(format!(
                "el job superó el deadline de {:?}",
                self.config.job_deadline.unwrap_or_default()
            )),
            other => other,
        };
        self.finish(flight.job, result);
    }

    fn finish(&mut self, mut job: Job, result: Result<ResponseRecord, String>) {
        let (status, outcome) = match result {
            Ok(response) => (JobStatus::Success, JobOutcome::Completed { response }),
            Err(reason) => (JobStatus::Failure, JobOutcome::Failed { reason }),
        };

        if let Err(e) = job.transition(status) {
            warn!("job {}: {}", job.id, e);
        }
        match status {
            JobStatus::Success => self.table.succeeded += 1,
            _ => self.table.failed += 1,
        }

        match &outcome {
            JobOutcome::Completed { .. } => info!(
                "job {} SUCCESS en {} ms",
                job.id,
                job.run_time_ms().unwrap_or_default()
            ),
            JobOutcome::Failed { reason } => warn!(
                "job {} FAILURE en {} ms: {}",
                job.id,
                job.run_time_ms().unwrap_or_default(),
                reason
            ),
        }

        let response = JobResponse {
            job_id: job.id,
            request: job.request,
            outcome,
        };
        if self.responses.send(response).is_err() {
            debug!("nadie escucha el canal de respuestas");
        }
    }

    /// Pendientes se descartan; los que corren se matan.
    async fn abort_in_flight(&mut self) {
        let dropped = self.table.pending.len();
        self.table.pending.clear();

        let running: Vec<InFlight> = self.table.in_flight.drain().map(|(_, f)| f).collect();
        if dropped > 0 || !running.is_empty() {
            info!(
                "descartando {} pendientes y terminando {} workers",
                dropped,
                running.len()
            );
        }

        for flight in running {
            flight.cancel.cancel();
            if let Err(e) = flight.drain.await {
                warn!("la tarea de drenado del job {} falló: {}", flight.job.id, e);
            }
        }
        self.stats.send_replace(self.table.stats());
    }
}

/// Lee todo el stream del worker y espera su salida. SUCCESS sólo con
/// respuesta válida y salida normal.
async fn drain_worker(
    job_id: JobId,
    handle: WorkerHandle,
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<Completion>,
) {
    let WorkerHandle { mut output, mut exit } = handle;

    let read = tokio::select! {
        _ = cancel.cancelled() => None,
        message = read_message(&mut output) => Some(message),
    };

    let result = match read {
        Some(Ok(message)) => {
            drop(output);
            let exited = tokio::select! {
                _ = cancel.cancelled() => None,
                ok = exit.wait() => Some(ok),
            };

            match (message, exited) {
                (_, None) => {
                    exit.terminate().await;
                    Err("worker terminado antes de salir".to_string())
                }
                (WorkerMessage::Failure(reason), _) => Err(reason),
                (WorkerMessage::Response(response), Some(true)) => Ok(response),
                (WorkerMessage::Response(_), Some(false)) => {
                    Err("el worker salió con error después de responder".to_string())
                }
            }
        }
        Some(Err(e)) => {
            drop(output);
            exit.terminate().await;
            Err(format!("salida del worker inválida: {e}"))
        }
        None => {
            drop(output);
            exit.terminate().await;
            Err("worker terminado antes de responder".to_string())
        }
    };

    if completions.send(Completion { job_id, result }).is_err() {
        debug!("controller detenido, se descarta el resultado del job {}", job_id);
    }
}
