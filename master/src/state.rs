// master/src/state.rs

use common::{Job, JobId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Contadores que publica el controller después de cada ciclo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub submitted: u64,
    pub pending: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
}

/// Job con un worker vivo.
#[derive(Debug)]
pub struct InFlight {
    pub job: Job,
    /// Cancela la tarea que drena la salida (y mata al worker).
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    pub expired: bool,
    pub drain: JoinHandle<()>,
}

/// Estado del controller. Lo toca una sola tarea, así que no hay locks.
#[derive(Debug, Default)]
pub struct JobTable {
    // jobs admitidos que todavía no tienen worker
    pub pending: VecDeque<Job>,
    pub in_flight: HashMap<JobId, InFlight>,

    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: Job) {
        self.submitted += 1;
        self.pending.push_back(job);
    }

    pub fn running(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            submitted: self.submitted,
            pending: self.pending.len(),
            running: self.running(),
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }
}
