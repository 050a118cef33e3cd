//! Contratos con los colaboradores externos: resolución de cohortes,
//! cálculo de métricas y registro de agregadores.

use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::response::Row;

pub type UserId = String;

/// Conjunto de usuarios sobre el que corre una métrica.
#[derive(Debug, Clone, PartialEq)]
pub enum UserSet {
    /// Un id de usuario suelto.
    Single(UserId),
    /// Usuarios resueltos desde una cohorte, en orden.
    Listed(Vec<UserId>),
    /// Todos los registrados; el engine los enumera de forma perezosa.
    AllRegistered,
}

impl UserSet {
    pub fn iter<'a>(&'a self, engine: &'a dyn MetricEngine) -> Box<dyn Iterator<Item = UserId> + 'a> {
        match self {
            UserSet::Single(user) => Box::new(std::iter::once(user.clone())),
            UserSet::Listed(users) => Box::new(users.iter().cloned()),
            UserSet::AllRegistered => engine.registered_users(),
        }
    }
}

/// Ventana y parámetros con los que se calcula una métrica.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub t: Option<f64>,
    pub n: Option<u64>,
}

/// Resultado tabular de una métrica: una fila por usuario.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    /// Columnas de valores (sin la columna de usuario).
    pub header: Vec<String>,
    pub rows: Vec<(UserId, Row)>,
}

impl MetricTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

pub trait CohortResolver: Send + Sync {
    /// Ids de usuario de la cohorte, en orden. Falla si no la conoce.
    fn resolve(&self, cohort_expr: &str) -> Result<Vec<UserId>>;

    /// Cuándo se generó la cohorte; `None` si el backend no lo sabe.
    fn refreshed_at(&self, _cohort_expr: &str) -> Option<NaiveDateTime> {
        None
    }
}

pub trait MetricEngine: Send + Sync {
    /// Columnas de valores que produce la métrica.
    fn header(&self, metric: &str) -> Result<Vec<String>>;

    fn process(&self, users: &UserSet, metric: &str, window: &MetricWindow) -> Result<MetricTable>;

    /// Enumeración perezosa de todos los usuarios registrados.
    fn registered_users(&self) -> Box<dyn Iterator<Item = UserId> + '_>;
}

/// Clave canónica de un agregador para una métrica concreta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregatorKey(String);

impl AggregatorKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Mean,
    /// Usuarios con valor distinto de cero.
    Count,
}

impl AggregateOp {
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Mean => "mean",
            AggregateOp::Count => "count",
        }
    }

    fn apply(self, values: &[f64]) -> Value {
        match self {
            AggregateOp::Sum => number(values.iter().sum()),
            AggregateOp::Mean if values.is_empty() => Value::Null,
            AggregateOp::Mean => number(values.iter().sum::<f64>() / values.len() as f64),
            AggregateOp::Count => Value::from(values.iter().filter(|v| **v != 0.0).count() as u64),
        }
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Reducción de las filas por usuario a una sola fila resumen.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregator {
    pub op: AggregateOp,
    /// Columna de la métrica sobre la que opera.
    pub field: String,
    /// Columnas que declara en la salida.
    pub header: Vec<String>,
}

impl Aggregator {
    pub fn new(op: AggregateOp, field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            op,
            header: vec![format!("{}_{}", op.name(), field)],
            field,
        }
    }

    pub fn apply(&self, table: &MetricTable) -> Result<Row> {
        let column = table.column(&self.field).ok_or_else(|| {
            Error::invalid(format!("la métrica no tiene la columna '{}'", self.field))
        })?;

        let values: Vec<f64> = table
            .rows
            .iter()
            .filter_map(|(_, row)| row.get(column).and_then(Value::as_f64))
            .collect();

        Ok(vec![self.op.apply(&values)])
    }
}

/// Registro (métrica, nombre de agregador) -> clave -> agregador.
#[derive(Debug, Clone, Default)]
pub struct AggregatorRegistry {
    keys: HashMap<(String, String), AggregatorKey>,
    aggregators: BTreeMap<AggregatorKey, Aggregator>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `sum`, `mean` y `count` sobre la columna principal de cada métrica.
    pub fn standard<'a>(metrics: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut registry = Self::new();
        for (metric, field) in metrics {
            for op in [AggregateOp::Sum, AggregateOp::Mean, AggregateOp::Count] {
                registry.register(metric, op.name(), Aggregator::new(op, field));
            }
        }
        registry
    }

    pub fn register(&mut self, metric: &str, name: &str, aggregator: Aggregator) -> AggregatorKey {
        let key = AggregatorKey(format!("{metric}::{name}"));
        self.keys
            .insert((metric.to_string(), name.to_string()), key.clone());
        self.aggregators.insert(key.clone(), aggregator);
        key
    }

    /// Clave canónica; `None` si la combinación no está registrada.
    pub fn key(&self, aggregator: &str, metric: &str) -> Option<AggregatorKey> {
        self.keys
            .get(&(metric.to_string(), aggregator.to_string()))
            .cloned()
    }

    pub fn aggregator(&self, key: &AggregatorKey) -> Option<&Aggregator> {
        self.aggregators.get(key)
    }

    /// Reduce una tabla con el agregador de `key`. Devuelve (header, fila).
    pub fn aggregate(&self, table: &MetricTable, key: &AggregatorKey) -> Result<(Vec<String>, Row)> {
        let aggregator = self.aggregator(key).ok_or_else(|| {
            let (metric, name) = key.as_str().split_once("::").unwrap_or(("", key.as_str()));
            Error::UnknownAggregator {
                metric: metric.to_string(),
                aggregator: name.to_string(),
            }
        })?;
        Ok((aggregator.header.clone(), aggregator.apply(table)?))
    }
}
