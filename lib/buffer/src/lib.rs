mod binary;
mod ingest;
pub mod queue;

pub use binary::{BinaryBatch, BinaryBatchQueue};
pub use ingest::{IngestReceiver, IngestSender, Ready, ingest};
