mod json;
pub mod proto;
mod protobuf;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

pub use json::JsonWriter;
pub use protobuf::ProtobufWriter;

use crate::batch::LogRecordBatch;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode protobuf failed, {0}")]
    Protobuf(#[from] prost::EncodeError),

    #[error("snappy compress failed, {0}")]
    Snappy(#[from] snap::Error),

    #[error("encode json failed, {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a batch into the wire format of the Loki push API.
///
/// A writer holds the result of the last `serialize_batch` until it is
/// extracted with `to_buffer`/`to_vec` or discarded with `reset`. Internal
/// buffers survive resets and are reused for the next batch.
pub trait Writer: Send {
    /// True when the output is not printable text.
    fn is_binary(&self) -> bool;

    fn serialize_batch(&mut self, batch: &LogRecordBatch) -> Result<(), EncodeError>;

    /// Size of the encoded output in bytes.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Appends the encoded output to `buf` and resets the writer.
    fn to_buffer(&mut self, buf: &mut dyn BufMut);

    fn to_vec(&mut self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.to_buffer(&mut buf);
        buf
    }

    fn reset(&mut self);
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterKind {
    #[default]
    Json,
    Protobuf,
}

impl WriterKind {
    pub const fn content_type(&self) -> &'static str {
        match self {
            WriterKind::Json => "application/json",
            WriterKind::Protobuf => "application/x-protobuf",
        }
    }

    /// Builds a writer sized for batches of about `capacity` bytes.
    pub fn build(&self, capacity: usize) -> Box<dyn Writer> {
        match self {
            WriterKind::Json => Box::new(JsonWriter::new(capacity)),
            WriterKind::Protobuf => Box::new(ProtobufWriter::new(capacity)),
        }
    }
}

/// Makes room for `additional` more bytes, growing by at least half of
/// the current capacity.
pub(crate) fn reserve(buf: &mut Vec<u8>, additional: usize) {
    let available = buf.capacity() - buf.len();
    if available >= additional {
        return;
    }

    let grow = additional.max(buf.capacity() / 2);
    buf.reserve_exact(grow);
}
