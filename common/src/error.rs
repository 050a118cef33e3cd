//! Errores del motor de métricas.
//!
//! Un solo enum para todo `common`. Los binarios lo envuelven en
//! `anyhow::Error` en sus bordes.

use crate::job::JobStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request mal formado: fechas ilegibles, campos obligatorios vacíos, etc.
    #[error("request inválido: {reason}")]
    InvalidRequest { reason: String },

    #[error("métrica desconocida: {0}")]
    UnknownMetric(String),

    /// No hay agregador registrado para esa combinación métrica/agregador.
    #[error("no hay agregador '{aggregator}' para la métrica '{metric}'")]
    UnknownAggregator { metric: String, aggregator: String },

    /// La expresión de cohorte no se pudo convertir en usuarios.
    #[error("no se pudo resolver la cohorte '{cohort}': {reason}")]
    CohortResolution { cohort: String, reason: String },

    /// Stream del worker truncado, corrupto o con versión desconocida.
    #[error("error de protocolo: {context}")]
    Protocol { context: String },

    #[error("dataset inválido: {reason}")]
    Dataset { reason: String },

    #[error("transición de estado inválida: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("el controller está detenido")]
    ControllerStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("no se pudo crear el pool de threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn protocol(context: impl Into<String>) -> Self {
        Error::Protocol {
            context: context.into(),
        }
    }
}
