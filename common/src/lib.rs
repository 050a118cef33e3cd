pub mod dataset;
pub mod error;
pub mod flow;
pub mod job;
pub mod metrics;
pub mod protocol;
pub mod request;
pub mod response;
pub mod worker;

pub use error::{Error, Result};
pub use job::{Job, JobId, JobOutcome, JobResponse, JobStatus};
pub use protocol::{WorkerMessage, DEFAULT_BLOCK_SIZE};
pub use request::{NormalizedRequest, RequestDescriptor};
pub use response::{KeyedRows, ResponseData, ResponseRecord};
pub use worker::MetricsBackend;
