use crate::state::{InFlight, JobTable};
use common::JobId;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::warn;

/// Jobs que pasaron su deadline y todavía no fueron marcados.
pub fn expired_jobs(in_flight: &HashMap<JobId, InFlight>, now: Instant) -> Vec<JobId> {
    let mut expired: Vec<JobId> = in_flight
        .iter()
        .filter(|(_, flight)| !flight.expired)
        .filter(|(_, flight)| flight.deadline.is_some_and(|deadline| now >= deadline))
        .map(|(id, _)| *id)
        .collect();
    expired.sort_unstable();
    expired
}

/// Marca y cancela los jobs vencidos. El job sigue en vuelo hasta que su
/// tarea de drenado reporte; ahí se cierra como FAILURE.
pub fn enforce_deadlines(table: &mut JobTable, now: Instant) {
    for job_id in expired_jobs(&table.in_flight, now) {
        if let Some(flight) = table.in_flight.get_mut(&job_id) {
            warn!("job {} superó su deadline, terminando el worker", job_id);
            flight.expired = true;
            flight.cancel.cancel();
        }
    }
}
