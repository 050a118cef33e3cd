use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::RequestDescriptor;
use crate::response::ResponseRecord;

/// Id de job: creciente y único mientras viva el controller.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    /// PENDING -> RUNNING -> {SUCCESS, FAILURE}. Nada más.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failure)
        )
    }
}

/// Registro de seguimiento de un request admitido.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: RequestDescriptor,
    status: JobStatus,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, request: RequestDescriptor) -> Self {
        Self {
            id,
            request,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Success | JobStatus::Failure => self.finished_at = Some(Utc::now()),
            JobStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    /// Milisegundos entre admisión y fin, si ya terminó.
    pub fn run_time_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Resultado final de un job, tal como se publica.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobOutcome {
    Completed { response: ResponseRecord },
    Failed { reason: String },
}

/// Lo que sale por el canal de respuestas: request original + resultado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub request: RequestDescriptor,
    pub outcome: JobOutcome,
}

impl JobResponse {
    pub fn response(&self) -> Option<&ResponseRecord> {
        match &self.outcome {
            JobOutcome::Completed { response } => Some(response),
            JobOutcome::Failed { .. } => None,
        }
    }
}
