//! Backend de referencia: usuarios, ediciones y cohortes en CSV.
//!
//! Archivos dentro del directorio de datos:
//! - `users.csv`   -> `user_id,registered`
//! - `edits.csv`   -> `user_id,timestamp,bytes`
//! - `cohorts.csv` -> `cohort,user_id[,refreshed]`
//!
//! Los timestamps aceptan los mismos formatos que los requests.

use chrono::{NaiveDateTime, TimeDelta};
use serde::Deserialize;
use serde_json::json;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io::Read,
    path::Path,
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::{
    AggregatorRegistry, CohortResolver, MetricEngine, MetricTable, MetricWindow, UserId, UserSet,
};
use crate::request::parse_timestamp;

pub const USERS_FILE: &str = "users.csv";
pub const EDITS_FILE: &str = "edits.csv";
pub const COHORTS_FILE: &str = "cohorts.csv";

/// Métricas que sabe calcular, con su columna principal.
pub const METRICS: &[(&str, &str)] = &[
    ("edit_count", "edit_count"),
    ("bytes_added", "bytes_added"),
    ("threshold", "threshold"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    EditCount,
    BytesAdded,
    /// 1 si el usuario llegó a `n` ediciones (default 1) en la ventana.
    Threshold,
}

impl Metric {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "edit_count" => Ok(Metric::EditCount),
            "bytes_added" => Ok(Metric::BytesAdded),
            "threshold" => Ok(Metric::Threshold),
            other => Err(Error::UnknownMetric(other.to_string())),
        }
    }

    fn column(self) -> &'static str {
        match self {
            Metric::EditCount => "edit_count",
            Metric::BytesAdded => "bytes_added",
            Metric::Threshold => "threshold",
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    user_id: String,
    registered: String,
}

#[derive(Debug, Deserialize)]
struct EditRecord {
    user_id: String,
    timestamp: String,
    #[serde(default)]
    bytes: i64,
}

#[derive(Debug, Deserialize)]
struct CohortRecord {
    cohort: String,
    user_id: String,
    /// Cuándo se regeneró la cohorte. Columna opcional.
    #[serde(default)]
    refreshed: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Edit {
    at: NaiveDateTime,
    bytes: i64,
}

#[derive(Debug, Default)]
pub struct CsvDataset {
    registered: BTreeMap<UserId, NaiveDateTime>,
    /// Ediciones por usuario, ordenadas por timestamp.
    edits: HashMap<UserId, Vec<Edit>>,
    cohorts: HashMap<String, Vec<UserId>>,
    refreshed: HashMap<String, NaiveDateTime>,
}

impl CsvDataset {
    pub fn open(dir: &Path) -> Result<Self> {
        let dataset = Self::from_readers(
            File::open(dir.join(USERS_FILE))?,
            File::open(dir.join(EDITS_FILE))?,
            File::open(dir.join(COHORTS_FILE))?,
        )?;

        info!(
            "dataset cargado desde {}: {} usuarios, {} cohortes",
            dir.display(),
            dataset.registered.len(),
            dataset.cohorts.len()
        );
        Ok(dataset)
    }

    pub fn from_readers(users: impl Read, edits: impl Read, cohorts: impl Read) -> Result<Self> {
        let mut dataset = Self::default();

        for record in csv::Reader::from_reader(users).deserialize() {
            let record: UserRecord = record?;
            let at = timestamp(&record.registered, USERS_FILE)?;
            dataset.registered.insert(record.user_id, at);
        }

        for record in csv::Reader::from_reader(edits).deserialize() {
            let record: EditRecord = record?;
            let at = timestamp(&record.timestamp, EDITS_FILE)?;
            dataset.edits.entry(record.user_id).or_default().push(Edit {
                at,
                bytes: record.bytes,
            });
        }
        for list in dataset.edits.values_mut() {
            list.sort_by_key(|e| e.at);
        }

        let mut seen: HashSet<(String, UserId)> = HashSet::new();
        for record in csv::Reader::from_reader(cohorts).deserialize() {
            let record: CohortRecord = record?;
            if let Some(raw) = record.refreshed.as_deref().filter(|r| !r.trim().is_empty()) {
                let at = timestamp(raw, COHORTS_FILE)?;
                let latest = dataset.refreshed.entry(record.cohort.clone()).or_insert(at);
                *latest = (*latest).max(at);
            }
            if seen.insert((record.cohort.clone(), record.user_id.clone())) {
                dataset.cohorts.entry(record.cohort).or_default().push(record.user_id);
            }
        }

        Ok(dataset)
    }

    /// Registro de agregadores para las métricas de este backend.
    pub fn aggregators() -> AggregatorRegistry {
        AggregatorRegistry::standard(METRICS.iter().copied())
    }

    fn cohort(&self, name: &str) -> Result<&[UserId]> {
        self.cohorts
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::CohortResolution {
                cohort: name.to_string(),
                reason: "cohorte desconocida".to_string(),
            })
    }

    /// Ventana efectiva del usuario: con `t`, se recorta a las `t` horas
    /// siguientes a su registro.
    fn user_window(&self, user: &str, window: &MetricWindow) -> (NaiveDateTime, NaiveDateTime) {
        let Some(t) = window.t else {
            return (window.start, window.end);
        };
        let Some(registered) = self.registered.get(user) else {
            return (window.start, window.start);
        };

        let limit = TimeDelta::try_seconds((t * 3600.0) as i64)
            .and_then(|d| registered.checked_add_signed(d))
            .unwrap_or(window.end);
        let from = window.start.max(*registered);
        let to = window.end.min(limit);
        (from, to.max(from))
    }

    fn edits_between(&self, user: &str, from: NaiveDateTime, to: NaiveDateTime) -> &[Edit] {
        let Some(list) = self.edits.get(user) else {
            return &[];
        };
        let lo = list.partition_point(|e| e.at < from);
        let hi = list.partition_point(|e| e.at < to);
        &list[lo..hi.max(lo)]
    }
}

fn timestamp(raw: &str, file: &str) -> Result<NaiveDateTime> {
    parse_timestamp(raw).ok_or_else(|| Error::Dataset {
        reason: format!("timestamp inválido en {file}: {raw}"),
    })
}

impl MetricEngine for CsvDataset {
    fn header(&self, metric: &str) -> Result<Vec<String>> {
        Ok(vec![Metric::parse(metric)?.column().to_string()])
    }

    fn process(&self, users: &UserSet, metric: &str, window: &MetricWindow) -> Result<MetricTable> {
        let metric = Metric::parse(metric)?;
        let threshold = window.n.unwrap_or(1);

        let mut rows = Vec::new();
        for user in users.iter(self) {
            let (from, to) = self.user_window(&user, window);
            let edits = self.edits_between(&user, from, to);

            let value = match metric {
                Metric::EditCount => json!(edits.len()),
                Metric::BytesAdded => json!(edits.iter().map(|e| e.bytes).sum::<i64>()),
                Metric::Threshold => json!(u8::from(edits.len() as u64 >= threshold)),
            };
            rows.push((user, vec![value]));
        }

        debug!(
            "métrica {} calculada para {} usuarios",
            metric.column(),
            rows.len()
        );
        Ok(MetricTable {
            header: vec![metric.column().to_string()],
            rows,
        })
    }

    fn registered_users(&self) -> Box<dyn Iterator<Item = UserId> + '_> {
        Box::new(self.registered.keys().cloned())
    }
}

impl CohortResolver for CsvDataset {
    /// Nombres de cohorte combinados de izquierda a derecha con
    /// `&` (intersección) y `~` (unión).
    fn resolve(&self, cohort_expr: &str) -> Result<Vec<UserId>> {
        let mut users: Vec<UserId> = Vec::new();
        let mut seen: HashSet<UserId> = HashSet::new();
        let mut op = '~';
        let mut rest = cohort_expr;

        loop {
            let split = rest.find(['&', '~']);
            let name = split.map_or(rest, |i| &rest[..i]).trim();
            if name.is_empty() {
                return Err(Error::CohortResolution {
                    cohort: cohort_expr.to_string(),
                    reason: "expresión mal formada".to_string(),
                });
            }

            let members = self.cohort(name)?;
            if op == '&' {
                let keep: HashSet<&UserId> = members.iter().collect();
                users.retain(|u| keep.contains(u));
                seen.retain(|u| keep.contains(u));
            } else {
                for user in members {
                    if seen.insert(user.clone()) {
                        users.push(user.clone());
                    }
                }
            }

            match split {
                Some(i) => {
                    op = if rest.as_bytes()[i] == b'&' { '&' } else { '~' };
                    rest = &rest[i + 1..];
                }
                None => break,
            }
        }

        Ok(users)
    }

    /// La más vieja de las cohortes nombradas en la expresión.
    fn refreshed_at(&self, cohort_expr: &str) -> Option<NaiveDateTime> {
        cohort_expr
            .split(['&', '~'])
            .filter_map(|name| self.refreshed.get(name.trim()))
            .min()
            .copied()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const USERS: &str = "user_id,registered\n\
        42,20240101000000\n\
        7,20240105000000\n\
        99,2024-01-08\n";

    pub(crate) const EDITS: &str = "user_id,timestamp,bytes\n\
        42,20240101100000,120\n\
        42,20240102110000,-20\n\
        42,20240104000000,50\n\
        7,20240105120000,10\n\
        7,20240109235959,5\n\
        99,20240108010000,300\n";

    pub(crate) const COHORTS: &str = "cohort,user_id,refreshed\n\
        editores,42,20240115000000\n\
        editores,7,\n\
        nuevos,7,2024-01-12\n\
        nuevos,99,20240112000000\n";

    pub(crate) fn fixture() -> CsvDataset {
        CsvDataset::from_readers(USERS.as_bytes(), EDITS.as_bytes(), COHORTS.as_bytes()).unwrap()
    }

    fn window(start: &str, end: &str) -> MetricWindow {
        MetricWindow {
            start: parse_timestamp(start).unwrap(),
            end: parse_timestamp(end).unwrap(),
            t: None,
            n: None,
        }
    }

    fn values(table: &MetricTable) -> Vec<(String, i64)> {
        table
            .rows
            .iter()
            .map(|(u, row)| (u.clone(), row[0].as_i64().unwrap()))
            .collect()
    }

    #[test]
    fn edit_count_respeta_la_ventana() {
        let ds = fixture();
        let users = UserSet::Listed(vec!["42".to_string(), "7".to_string()]);

        let table = ds
            .process(&users, "edit_count", &window("20240101", "20240104"))
            .unwrap();

        assert_eq!(table.header, vec!["edit_count".to_string()]);
        // la edición del 4/1 00:00 queda fuera: la ventana es semiabierta
        assert_eq!(values(&table), vec![("42".into(), 2), ("7".into(), 0)]);
    }

    #[test]
    fn bytes_added_y_threshold() {
        let ds = fixture();
        let users = UserSet::Single("42".to_string());
        let w = window("20240101", "20240110");

        let bytes = ds.process(&users, "bytes_added", &w).unwrap();
        assert_eq!(values(&bytes), vec![("42".into(), 150)]);

        let mut w3 = w.clone();
        w3.n = Some(3);
        let hit = ds.process(&users, "threshold", &w3).unwrap();
        assert_eq!(values(&hit), vec![("42".into(), 1)]);

        w3.n = Some(4);
        let miss = ds.process(&users, "threshold", &w3).unwrap();
        assert_eq!(values(&miss), vec![("42".into(), 0)]);
    }

    #[test]
    fn parametro_t_recorta_desde_el_registro() {
        let ds = fixture();
        let mut w = window("20240101", "20240110");
        w.t = Some(48.0);

        let table = ds
            .process(&UserSet::Single("42".to_string()), "edit_count", &w)
            .unwrap();
        assert_eq!(values(&table), vec![("42".into(), 2)]);
    }

    #[test]
    fn all_registered_enumera_todos() {
        let ds = fixture();
        let table = ds
            .process(&UserSet::AllRegistered, "edit_count", &window("20240101", "20240110"))
            .unwrap();

        assert_eq!(table.rows.len(), 3);
    }

    #[test]
    fn metrica_desconocida_es_error() {
        let ds = fixture();
        let err = ds
            .process(&UserSet::AllRegistered, "revert_rate", &window("20240101", "20240110"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownMetric(_)));
    }

    #[test]
    fn resolve_combina_cohortes() {
        let ds = fixture();

        assert_eq!(ds.resolve("editores").unwrap(), vec!["42", "7"]);
        assert_eq!(ds.resolve("editores & nuevos").unwrap(), vec!["7"]);
        assert_eq!(ds.resolve("editores~nuevos").unwrap(), vec!["42", "7", "99"]);
    }

    #[test]
    fn refresco_es_el_mas_viejo_de_la_expresion() {
        let ds = fixture();

        assert_eq!(ds.refreshed_at("editores"), parse_timestamp("20240115"));
        assert_eq!(ds.refreshed_at("editores & nuevos"), parse_timestamp("20240112"));
        assert_eq!(ds.refreshed_at("fantasma"), None);
    }

    #[test]
    fn union_sin_repetidos_y_en_orden() {
        let cohorts = "cohort,user_id\n\
            a,3\n\
            a,1\n\
            a,3\n\
            b,2\n\
            b,1\n\
            c,4\n\
            c,3\n";
        let ds = CsvDataset::from_readers(USERS.as_bytes(), EDITS.as_bytes(), cohorts.as_bytes()).unwrap();

        // sin columna `refreshed` no hay fecha de refresco
        assert_eq!(ds.refreshed_at("a~b"), None);
        // el CSV repite 3 en `a`: se guarda una sola vez
        assert_eq!(ds.resolve("a").unwrap(), vec!["3", "1"]);
        assert_eq!(ds.resolve("a~b~a~c").unwrap(), vec!["3", "1", "2", "4"]);
        // después de una intersección, la unión vuelve a sumar a los que salieron
        assert_eq!(ds.resolve("a~b&b~c").unwrap(), vec!["1", "2", "4", "3"]);
    }

    #[test]
    fn resolve_falla_con_cohorte_desconocida_o_mal_formada() {
        let ds = fixture();

        assert!(matches!(
            ds.resolve("fantasma"),
            Err(Error::CohortResolution { .. })
        ));
        assert!(ds.resolve("editores&").is_err());
    }

    #[test]
    fn timestamp_invalido_en_csv_es_error() {
        let bad_users = "user_id,registered\n42,mañana\n";
        let res = CsvDataset::from_readers(bad_users.as_bytes(), EDITS.as_bytes(), COHORTS.as_bytes());
        assert!(matches!(res, Err(Error::Dataset { .. })));
    }
}
