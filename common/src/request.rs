use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::flow::total_intervals;

/// Formato fijo de timestamps en todo el motor: `YYYYMMDDHHMMSS`.
pub const DATETIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Largo de intervalo (horas) cuando el request no trae uno.
pub const DEFAULT_INTERVAL_HOURS: f64 = 24.0;

/// Ventana por defecto (días) cuando falta `date_start`.
pub const DEFAULT_WINDOW_DAYS: i64 = 1;

/// Paso mínimo de una serie de tiempo, en segundos.
pub const MIN_INTERVAL_SECS: f64 = 1.0;

/// Tope de intervalos que puede pedir una serie de tiempo.
pub const MAX_INTERVALS: f64 = 100_000.0;

/// Cohorte especial que significa "todos los usuarios registrados".
pub const ALL_USERS_COHORT: &str = "all";

const DATETIME_INPUTS: &[&str] = &[
    DATETIME_FORMAT,
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const DATE_INPUTS: &[&str] = &["%Y%m%d", "%Y-%m-%d"];

/// Request de métrica tal como llega al canal de admisión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub cohort_expr: String,
    #[serde(default)]
    pub cohort_gen_timestamp: Option<String>,
    pub metric: String,
    #[serde(default, alias = "timeseries")]
    pub time_series: bool,
    #[serde(default)]
    pub aggregator: Option<String>,
    #[serde(default)]
    pub date_start: Option<String>,
    #[serde(default)]
    pub date_end: Option<String>,
    /// Largo del intervalo en horas (sólo series de tiempo).
    #[serde(default)]
    pub interval: Option<f64>,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
}

impl RequestDescriptor {
    pub fn new(cohort_expr: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            cohort_expr: cohort_expr.into(),
            cohort_gen_timestamp: None,
            metric: metric.into(),
            time_series: false,
            aggregator: None,
            date_start: None,
            date_end: None,
            interval: None,
            t: None,
            n: None,
        }
    }

    /// Chequeo mínimo antes de admitir: cohorte y métrica presentes.
    pub fn validate(&self) -> Result<()> {
        if self.cohort_expr.trim().is_empty() {
            return Err(Error::invalid("falta cohort_expr"));
        }
        if self.metric.trim().is_empty() {
            return Err(Error::invalid("falta metric"));
        }
        Ok(())
    }

    /// Aplica defaults y normaliza fechas. No toca `self`: devuelve un
    /// valor nuevo e inmutable.
    pub fn normalize(&self, now: NaiveDateTime) -> Result<NormalizedRequest> {
        self.validate()?;

        let end = match self.date_end.as_deref() {
            Some(raw) => parse_day(raw, "date_end")?,
            None => start_of_day(now.date()),
        };
        let start = match self.date_start.as_deref() {
            Some(raw) => parse_day(raw, "date_start")?,
            None => end - TimeDelta::days(DEFAULT_WINDOW_DAYS),
        };
        if end < start {
            return Err(Error::invalid(format!(
                "date_end ({}) es anterior a date_start ({})",
                format_timestamp(end),
                format_timestamp(start)
            )));
        }

        let interval_hours = match self.interval {
            None => DEFAULT_INTERVAL_HOURS,
            Some(h) if h.is_finite() && h * 3600.0 >= MIN_INTERVAL_SECS => h,
            Some(h) => return Err(Error::invalid(format!("intervalo inválido: {h}"))),
        };
        if self.time_series {
            let total = total_intervals(start, end, interval_hours);
            if total > MAX_INTERVALS {
                return Err(Error::invalid(format!(
                    "la serie pide {} intervalos, el máximo es {MAX_INTERVALS}",
                    total.ceil()
                )));
            }
        }

        let t = match self.t.as_deref() {
            Some(raw) => Some(
                raw.trim()
                    .parse::<f64>()
                    .map_err(|_| Error::invalid(format!("parámetro t inválido: {raw}")))?,
            ),
            None => None,
        };
        let n = match self.n.as_deref() {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| Error::invalid(format!("parámetro n inválido: {raw}")))?,
            ),
            None => None,
        };

        let mut params = BTreeMap::new();
        if let Some(raw) = &self.t {
            params.insert("t".to_string(), raw.clone());
        }
        if let Some(raw) = &self.n {
            params.insert("n".to_string(), raw.clone());
        }

        Ok(NormalizedRequest {
            cohort_expr: self.cohort_expr.trim().to_string(),
            cohort_gen_timestamp: self
                .cohort_gen_timestamp
                .clone()
                .unwrap_or_else(|| format_timestamp(now)),
            metric: self.metric.trim().to_string(),
            time_series: self.time_series,
            aggregator: self
                .aggregator
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            start,
            end,
            interval_hours,
            t,
            n,
            params,
        })
    }
}

/// Request ya normalizado. Se construye una sola vez y no se muta más.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub cohort_expr: String,
    pub cohort_gen_timestamp: String,
    pub metric: String,
    pub time_series: bool,
    pub aggregator: Option<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub interval_hours: f64,
    /// Horas desde el registro del usuario que cubre la métrica.
    pub t: Option<f64>,
    /// Umbral de ediciones para la métrica `threshold`.
    pub n: Option<u64>,
    /// Parámetros de métrica tal como vinieron, para devolverlos en la respuesta.
    pub params: BTreeMap<String, String>,
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

/// Parsea un timestamp en cualquiera de los formatos aceptados.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DATETIME_INPUTS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_INPUTS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .map(start_of_day)
        })
}

fn parse_day(raw: &str, field: &str) -> Result<NaiveDateTime> {
    parse_timestamp(raw)
        .map(|ts| start_of_day(ts.date()))
        .ok_or_else(|| Error::invalid(format!("{field} con formato inválido: {raw}")))
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}
