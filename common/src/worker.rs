//! Ejecución de un job dentro del worker.
//!
//! Resuelve usuarios, normaliza el request, corre el coordinador y escribe
//! el resultado con el protocolo de bloques. Lo usan el binario `worker` y
//! el launcher en proceso del master.

use chrono::{Local, NaiveDateTime};
use std::{io::Write, path::Path, sync::Arc, time::Instant};
use tracing::{info, warn};

use crate::dataset::CsvDataset;
use crate::error::Result;
use crate::flow::Coordinator;
use crate::metrics::{AggregatorRegistry, CohortResolver, MetricEngine, UserSet};
use crate::protocol::{write_message, WorkerMessage};
use crate::request::{format_timestamp, RequestDescriptor, ALL_USERS_COHORT};
use crate::response::ResponseRecord;

/// Colaboradores externos que necesita un worker.
#[derive(Clone)]
pub struct MetricsBackend {
    pub engine: Arc<dyn MetricEngine>,
    pub resolver: Arc<dyn CohortResolver>,
    pub aggregators: Arc<AggregatorRegistry>,
}

impl MetricsBackend {
    pub fn from_dataset(dataset: CsvDataset) -> Self {
        let dataset = Arc::new(dataset);
        Self {
            engine: dataset.clone(),
            resolver: dataset,
            aggregators: Arc::new(CsvDataset::aggregators()),
        }
    }

    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self::from_dataset(CsvDataset::open(data_dir)?))
    }
}

/// Un id numérico es un usuario suelto, `all` son todos los registrados y
/// cualquier otra cosa se le pasa al resolver de cohortes.
pub fn resolve_users(cohort_expr: &str, resolver: &dyn CohortResolver) -> Result<UserSet> {
    let cohort = cohort_expr.trim();

    if !cohort.is_empty() && cohort.chars().all(|c| c.is_ascii_digit()) {
        return Ok(UserSet::Single(cohort.to_string()));
    }
    if cohort == ALL_USERS_COHORT {
        return Ok(UserSet::AllRegistered);
    }
    Ok(UserSet::Listed(resolver.resolve(cohort)?))
}

/// Corre un request completo. Una cohorte irresoluble aborta el job con
/// `WorkerMessage::Failure`; un request mal formado vuelve como respuesta
/// con mensaje de fallo.
pub fn execute(descriptor: &RequestDescriptor, backend: &MetricsBackend, now: NaiveDateTime) -> WorkerMessage {
    let users = match resolve_users(&descriptor.cohort_expr, backend.resolver.as_ref()) {
        Ok(users) => users,
        Err(e) => {
            warn!("abortando worker: {}", e);
            return WorkerMessage::Failure(e.to_string());
        }
    };

    let mut descriptor = descriptor.clone();
    if descriptor.cohort_gen_timestamp.is_none() && matches!(users, UserSet::Listed(_)) {
        descriptor.cohort_gen_timestamp = backend
            .resolver
            .refreshed_at(descriptor.cohort_expr.trim())
            .map(format_timestamp);
    }

    let request = match descriptor.normalize(now) {
        Ok(request) => request,
        Err(e) => {
            warn!("request de {} mal formado: {}", descriptor.metric, e);
            return WorkerMessage::Response(ResponseRecord::rejected(&descriptor, e.to_string()));
        }
    };

    let coordinator = Coordinator::new(backend.engine.as_ref(), backend.aggregators.as_ref());
    WorkerMessage::Response(coordinator.process_data_request(&request, &users))
}

/// Ejecuta y escribe el resultado en `out`. Devuelve `false` si el worker
/// tiene que terminar con código de error.
pub fn run<W: Write>(
    descriptor: &RequestDescriptor,
    backend: &MetricsBackend,
    out: &mut W,
    block_size: usize,
) -> Result<bool> {
    let started = Instant::now();
    let message = execute(descriptor, backend, Local::now().naive_local());
    let ok = matches!(message, WorkerMessage::Response(_));

    write_message(out, &message, block_size)?;

    info!(
        "request {} sobre '{}' terminado en {} ms (ok={})",
        descriptor.metric,
        descriptor.cohort_expr,
        started.elapsed().as_millis(),
        ok
    );
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::fixture;
    use crate::protocol::read_message;
    use crate::request::parse_timestamp;
    use crate::response::ResponseData;
    use serde_json::json;

    fn backend() -> MetricsBackend {
        MetricsBackend::from_dataset(fixture())
    }

    fn now() -> NaiveDateTime {
        parse_timestamp("20240120").unwrap()
    }

    #[test]
    fn resolucion_de_usuarios() {
        let ds = fixture();

        assert_eq!(resolve_users("42", &ds).unwrap(), UserSet::Single("42".to_string()));
        assert_eq!(resolve_users("all", &ds).unwrap(), UserSet::AllRegistered);
        assert_eq!(
            resolve_users("nuevos", &ds).unwrap(),
            UserSet::Listed(vec!["7".to_string(), "99".to_string()])
        );
        assert!(resolve_users("fantasma", &ds).is_err());
    }

    #[test]
    fn usuario_suelto_devuelve_una_fila() {
        let mut req = RequestDescriptor::new("42", "edit_count");
        req.date_start = Some("2024-01-01".to_string());
        req.date_end = Some("2024-01-03".to_string());

        let WorkerMessage::Response(resp) = execute(&req, &backend(), now()) else {
            panic!("se esperaba una respuesta");
        };
        assert_eq!(resp.start, "20240101000000");
        assert_eq!(resp.header, vec!["user_id", "edit_count"]);
        let ResponseData::Keyed(rows) = &resp.data else {
            panic!("se esperaba un objeto por usuario, vino {:?}", resp.data);
        };
        assert_eq!(rows.keys().collect::<Vec<_>>(), vec!["42"]);
        assert_eq!(rows.get("42"), Some(&vec![json!(2)]));
    }

    #[test]
    fn serie_con_intervalo_sub_segundo_es_respuesta_con_fallo() {
        let mut req = RequestDescriptor::new("all", "edit_count");
        req.time_series = true;
        req.aggregator = Some("sum".to_string());
        req.interval = Some(0.0001);
        req.date_start = Some("20240101".to_string());
        req.date_end = Some("20240111".to_string());

        let WorkerMessage::Response(resp) = execute(&req, &backend(), now()) else {
            panic!("se esperaba una respuesta");
        };
        let msg = resp.failure_message().unwrap();
        assert!(msg.contains("intervalo inválido"));
    }

    #[test]
    fn cohort_gen_timestamp_sale_del_refresco_de_la_cohorte() {
        let mut req = RequestDescriptor::new("editores&nuevos", "edit_count");
        req.date_start = Some("20240101".to_string());
        req.date_end = Some("20240110".to_string());

        let WorkerMessage::Response(resp) = execute(&req, &backend(), now()) else {
            panic!("se esperaba una respuesta");
        };
        assert_eq!(resp.cohort_gen_timestamp, "20240112000000");

        // el que manda el request tiene prioridad
        req.cohort_gen_timestamp = Some("20231231000000".to_string());
        let WorkerMessage::Response(resp) = execute(&req, &backend(), now()) else {
            panic!("se esperaba una respuesta");
        };
        assert_eq!(resp.cohort_gen_timestamp, "20231231000000");

        // un usuario suelto no tiene cohorte: queda la hora de normalización
        let solo = RequestDescriptor::new("42", "edit_count");
        let WorkerMessage::Response(resp) = execute(&solo, &backend(), now()) else {
            panic!("se esperaba una respuesta");
        };
        assert_eq!(resp.cohort_gen_timestamp, "20240120000000");
    }

    #[test]
    fn request_mal_formado_es_respuesta_con_fallo() {
        let mut req = RequestDescriptor::new("42", "edit_count");
        req.date_start = Some("20240110".to_string());
        req.date_end = Some("20240101".to_string());

        let WorkerMessage::Response(resp) = execute(&req, &backend(), now()) else {
            panic!("se esperaba una respuesta");
        };
        assert!(resp.failure_message().is_some());
    }

    #[test]
    fn cohorte_desconocida_aborta() {
        let req = RequestDescriptor::new("fantasma", "edit_count");
        assert!(matches!(
            execute(&req, &backend(), now()),
            WorkerMessage::Failure(_)
        ));
    }

    #[tokio::test]
    async fn run_escribe_un_stream_legible() {
        let mut req = RequestDescriptor::new("editores", "bytes_added");
        req.aggregator = Some("sum".to_string());
        req.date_start = Some("20240101".to_string());
        req.date_end = Some("20240110".to_string());

        let mut out = Vec::new();
        // bloque chico para forzar varios bloques
        assert!(run(&req, &backend(), &mut out, 32).unwrap());

        let mut reader: &[u8] = &out;
        let WorkerMessage::Response(resp) = read_message(&mut reader).await.unwrap() else {
            panic!("se esperaba una respuesta");
        };
        // 42: 120 - 20 + 50, 7: 10 + 5
        assert_eq!(resp.data, ResponseData::Rows(vec![vec![json!(165)]]));

        let mut out = Vec::new();
        let bad = RequestDescriptor::new("fantasma", "edit_count");
        assert!(!run(&bad, &backend(), &mut out, 32).unwrap());
    }
}
