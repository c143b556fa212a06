#[macro_use]
extern crate tracing;

pub mod batch;
pub mod config;
pub mod http;
pub mod metrics;
mod pipeline;
pub mod record;
pub mod trace;
pub mod writer;

pub use batch::{BatchCondition, Batcher, LogRecordBatch, SizeEstimation};
pub use config::{BatchConfig, ConfigError, PipelineConfig};
pub use http::{Auth, HttpClient, HttpConfig, HttpError, PushClient, PushResponse};
pub use crate::metrics::{MetricsSnapshot, PipelineMetrics};
pub use ::metrics::{Attributes, Observation, Registry, Reporter};
pub use pipeline::Pipeline;
pub use record::{LogRecord, LogRecordStream, StreamInterner, StreamRef};
pub use writer::{EncodeError, JsonWriter, ProtobufWriter, Writer, WriterKind};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;
