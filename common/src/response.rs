use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::Value;
use std::{collections::BTreeMap, fmt};

use crate::request::{format_timestamp, NormalizedRequest, RequestDescriptor};

/// Prefijo del mensaje que viaja en `data` cuando el request falló lógicamente.
pub const FAILURE_PREFIX: &str = "Request failed. ";

/// Una fila de resultados (valores JSON, como los records del engine).
pub type Row = Vec<Value>;

/// Payload de la respuesta. La forma depende del tipo de request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    /// Mensaje de fallo (empieza con `FAILURE_PREFIX`).
    Failed(String),
    /// Agregado: una sola fila.
    Rows(Vec<Row>),
    /// Raw: user_id -> fila, en el orden del conjunto de usuarios.
    /// Serie de tiempo: timestamp normalizado -> fila, en orden cronológico.
    Keyed(KeyedRows),
}

/// Filas indexadas por clave, en orden de inserción. En JSON es un objeto y
/// al leerlo se respeta el orden del documento.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedRows(Vec<(String, Row)>);

impl KeyedRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega al final; una clave repetida reemplaza la fila sin moverla.
    pub fn insert(&mut self, key: impl Into<String>, row: Row) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = row,
            None => self.0.push((key, row)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, row)| row)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Row)> {
        self.0.iter().map(|(k, row)| (k.as_str(), row))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Las claves llegan únicas (usuarios resueltos, tramos de la partición).
impl FromIterator<(String, Row)> for KeyedRows {
    fn from_iter<I: IntoIterator<Item = (String, Row)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for KeyedRows {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, row) in &self.0 {
            map.serialize_entry(key, row)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for KeyedRows {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyedRowsVisitor;

        impl<'de> Visitor<'de> for KeyedRowsVisitor {
            type Value = KeyedRows;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("un objeto de clave -> fila")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<KeyedRows, A::Error> {
                let mut rows = KeyedRows(Vec::with_capacity(access.size_hint().unwrap_or(0)));
                while let Some(entry) = access.next_entry::<String, Row>()? {
                    rows.0.push(entry);
                }
                Ok(rows)
            }
        }

        deserializer.deserialize_map(KeyedRowsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub header: Vec<String>,
    pub cohort_expr: String,
    pub cohort_gen_timestamp: String,
    pub metric: String,
    pub timeseries: bool,
    pub aggregator: Option<String>,
    pub start: String,
    pub end: String,
    /// Parámetros de métrica (`t`, `n`) aplanados en el objeto.
    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
    pub data: ResponseData,
}

impl ResponseRecord {
    /// Respuesta vacía que repite los parámetros del request.
    pub fn for_request(request: &NormalizedRequest) -> Self {
        Self {
            header: Vec::new(),
            cohort_expr: request.cohort_expr.clone(),
            cohort_gen_timestamp: request.cohort_gen_timestamp.clone(),
            metric: request.metric.clone(),
            timeseries: request.time_series,
            aggregator: request.aggregator.clone(),
            start: format_timestamp(request.start),
            end: format_timestamp(request.end),
            params: request.params.clone(),
            data: ResponseData::Rows(Vec::new()),
        }
    }

    /// Respuesta para un request que ni siquiera se pudo normalizar.
    pub fn rejected(request: &RequestDescriptor, reason: impl AsRef<str>) -> Self {
        let mut params = BTreeMap::new();
        if let Some(t) = &request.t {
            params.insert("t".to_string(), t.clone());
        }
        if let Some(n) = &request.n {
            params.insert("n".to_string(), n.clone());
        }

        Self {
            header: Vec::new(),
            cohort_expr: request.cohort_expr.clone(),
            cohort_gen_timestamp: request.cohort_gen_timestamp.clone().unwrap_or_default(),
            metric: request.metric.clone(),
            timeseries: request.time_series,
            aggregator: request.aggregator.clone(),
            start: request.date_start.clone().unwrap_or_default(),
            end: request.date_end.clone().unwrap_or_default(),
            params,
            data: ResponseData::Failed(format!("{FAILURE_PREFIX}{}", reason.as_ref())),
        }
    }

    pub fn with_failure(mut self, reason: impl AsRef<str>) -> Self {
        self.data = ResponseData::Failed(format!("{FAILURE_PREFIX}{}", reason.as_ref()));
        self
    }

    /// Mensaje de fallo si el request falló lógicamente. Quien consume la
    /// respuesta tiene que mirar esto antes de leer `data`.
    pub fn failure_message(&self) -> Option<&str> {
        match &self.data {
            ResponseData::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}
