//! Coordinación del flujo de un request.
//!
//! Dado un request normalizado y un conjunto de usuarios, decide si la
//! respuesta es un listado raw, un agregado o una serie de tiempo, y arma el
//! `ResponseRecord`. Los errores de métrica/agregador no salen de acá: se
//! convierten en una respuesta con mensaje de fallo en `data`.

use chrono::{NaiveDateTime, TimeDelta};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::metrics::{AggregatorKey, AggregatorRegistry, MetricEngine, MetricWindow, UserSet};
use crate::request::{format_timestamp, NormalizedRequest};
use crate::response::{KeyedRows, ResponseData, ResponseRecord, Row};

/// Un thread por cada tantos intervalos de la serie.
pub const INTERVALS_PER_THREAD: usize = 10;

/// Tope de threads para una serie de tiempo.
pub const MAX_THREADS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Raw,
    Aggregate,
    TimeSeries,
}

/// Cada request cae en exactamente un tipo.
pub fn classify(request: &NormalizedRequest) -> RequestKind {
    if request.time_series {
        RequestKind::TimeSeries
    } else if request.aggregator.is_some() {
        RequestKind::Aggregate
    } else {
        RequestKind::Raw
    }
}

/// Paso de la serie redondeado al milisegundo. Lo usan tanto el conteo de
/// intervalos como la partición.
pub fn interval_step(interval_hours: f64) -> TimeDelta {
    let millis = (interval_hours * 3_600_000.0).round() as i64;
    TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX)
}

/// Cantidad (fraccionaria) de intervalos de `interval_hours` en el rango.
pub fn total_intervals(start: NaiveDateTime, end: NaiveDateTime, interval_hours: f64) -> f64 {
    let step = interval_step(interval_hours).num_milliseconds();
    if step <= 0 {
        return f64::INFINITY;
    }
    (end - start).num_milliseconds() as f64 / step as f64
}

/// `clamp(floor(total / INTERVALS_PER_THREAD), 1, MAX_THREADS)`
pub fn thread_allocation(total_intervals: f64) -> usize {
    let threads = (total_intervals / INTERVALS_PER_THREAD as f64).floor();
    // NaN y negativos saturan a 0 en el cast
    (threads as usize).clamp(1, MAX_THREADS)
}

/// Parte `[start, end)` en tramos de `interval_hours`; el último se recorta
/// en `end`. Da `ceil(total_intervals)` tramos. Un paso nulo no parte nada:
/// `normalize` ya rechaza pasos menores a un segundo.
pub fn partition(
    start: NaiveDateTime,
    end: NaiveDateTime,
    interval_hours: f64,
) -> Vec<(NaiveDateTime, NaiveDateTime)> {
    let step = interval_step(interval_hours);
    if step <= TimeDelta::zero() {
        return Vec::new();
    }

    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor
            .checked_add_signed(step)
            .map_or(end, |n| n.min(end));
        slices.push((cursor, next));
        cursor = next;
    }
    slices
}

pub struct Coordinator<'a> {
    engine: &'a dyn MetricEngine,
    aggregators: &'a AggregatorRegistry,
}

impl<'a> Coordinator<'a> {
    pub fn new(engine: &'a dyn MetricEngine, aggregators: &'a AggregatorRegistry) -> Self {
        Self {
            engine,
            aggregators,
        }
    }

    /// Punto de entrada: arma la respuesta completa del request.
    pub fn process_data_request(&self, request: &NormalizedRequest, users: &UserSet) -> ResponseRecord {
        let record = ResponseRecord::for_request(request);

        let agg_key = request
            .aggregator
            .as_deref()
            .and_then(|name| self.aggregators.key(name, &request.metric));

        let outcome = match classify(request) {
            RequestKind::TimeSeries => self.time_series(request, users, agg_key),
            RequestKind::Aggregate => self.aggregate(request, users, agg_key),
            RequestKind::Raw => self.raw(request, users),
        };

        match outcome {
            Ok((header, data)) => ResponseRecord {
                header,
                data,
                ..record
            },
            Err(e) => {
                warn!("request de {} sobre '{}' falló: {}", request.metric, request.cohort_expr, e);
                record.with_failure(e.to_string())
            }
        }
    }

    fn time_series(
        &self,
        request: &NormalizedRequest,
        users: &UserSet,
        agg_key: Option<AggregatorKey>,
    ) -> Result<(Vec<String>, ResponseData)> {
        let key = self.require_key(request, agg_key)?;

        let total = total_intervals(request.start, request.end, request.interval_hours);
        let threads = thread_allocation(total);
        let slices = partition(request.start, request.end, request.interval_hours);

        info!(
            "serie de tiempo para {} (agregador={}) desde {} hasta {}: {} intervalos, {} threads",
            request.metric,
            key.as_str(),
            format_timestamp(request.start),
            format_timestamp(request.end),
            slices.len(),
            threads
        );

        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        let points: Vec<(String, Row)> = pool.install(|| {
            slices
                .par_iter()
                .map(|&(from, to)| {
                    let window = MetricWindow {
                        start: from,
                        end: to,
                        t: request.t,
                        n: request.n,
                    };
                    let table = self.engine.process(users, &request.metric, &window)?;
                    let (_, row) = self.aggregators.aggregate(&table, &key)?;
                    Ok((format_timestamp(from), row))
                })
                .collect::<Result<Vec<(String, Row)>>>()
        })?;

        let mut header = vec!["timestamp".to_string()];
        if let Some(aggregator) = self.aggregators.aggregator(&key) {
            header.extend(aggregator.header.iter().cloned());
        }
        // collect conserva el orden de los tramos: queda cronológico
        Ok((header, ResponseData::Keyed(points.into_iter().collect())))
    }

    fn aggregate(
        &self,
        request: &NormalizedRequest,
        users: &UserSet,
        agg_key: Option<AggregatorKey>,
    ) -> Result<(Vec<String>, ResponseData)> {
        let key = self.require_key(request, agg_key)?;

        info!(
            "agregado {} para {} desde {} hasta {}",
            key.as_str(),
            request.metric,
            format_timestamp(request.start),
            format_timestamp(request.end)
        );

        let table = self.engine.process(users, &request.metric, &full_window(request))?;
        let (header, row) = self.aggregators.aggregate(&table, &key)?;
        Ok((header, ResponseData::Rows(vec![row])))
    }

    fn raw(&self, request: &NormalizedRequest, users: &UserSet) -> Result<(Vec<String>, ResponseData)> {
        info!(
            "request raw de {} desde {} hasta {}",
            request.metric,
            format_timestamp(request.start),
            format_timestamp(request.end)
        );

        let mut header = vec!["user_id".to_string()];
        header.extend(self.engine.header(&request.metric)?);

        let table = self.engine.process(users, &request.metric, &full_window(request))?;
        let rows: KeyedRows = table.rows.into_iter().collect();
        Ok((header, ResponseData::Keyed(rows)))
    }

    fn require_key(&self, request: &NormalizedRequest, key: Option<AggregatorKey>) -> Result<AggregatorKey> {
        key.ok_or_else(|| Error::UnknownAggregator {
            metric: request.metric.clone(),
            aggregator: request.aggregator.clone().unwrap_or_else(|| "none".to_string()),
        })
    }
}

fn full_window(request: &NormalizedRequest) -> MetricWindow {
    MetricWindow {
        start: request.start,
        end: request.end,
        t: request.t,
        n: request.n,
    }
}
