use bytes::BufMut;
use prost::Message;

use super::proto::{EntryAdapter, LabelPairAdapter, PushRequest, StreamAdapter};
use super::{EncodeError, Writer, reserve};
use crate::batch::LogRecordBatch;
use crate::record::{LogRecord, LogRecordStream};

/// Writes a snappy (block format) compressed protobuf `PushRequest`.
pub struct ProtobufWriter {
    request: PushRequest,
    uncompressed: Vec<u8>,
    compressed: Vec<u8>,
    size: usize,

    encoder: snap::raw::Encoder,
}

impl ProtobufWriter {
    pub fn new(capacity: usize) -> Self {
        // compressed protobuf of small batches may still end up larger than
        // the plain json estimate
        let capacity = capacity + capacity / 2;

        ProtobufWriter {
            request: PushRequest::default(),
            uncompressed: Vec::with_capacity(capacity),
            compressed: Vec::with_capacity(capacity),
            size: 0,
            encoder: snap::raw::Encoder::new(),
        }
    }
}

fn stream(stream: &LogRecordStream) -> StreamAdapter {
    StreamAdapter {
        labels: stream.selector(),
        entries: vec![],
        hash: 0,
    }
}

fn entry(record: &LogRecord) -> EntryAdapter {
    EntryAdapter {
        timestamp: Some(prost_types::Timestamp {
            seconds: record.timestamp_ms().div_euclid(1000),
            // at most 999_999_999, fits an i32
            nanos: (record.timestamp_ms().rem_euclid(1000) * 1_000_000
                + i64::from(record.nanos_in_ms())) as i32,
        }),
        line: record.message().to_string(),
        structured_metadata: record
            .metadata()
            .iter()
            .map(|(name, value)| LabelPairAdapter {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}

impl Writer for ProtobufWriter {
    fn is_binary(&self) -> bool {
        true
    }

    fn serialize_batch(&mut self, batch: &LogRecordBatch) -> Result<(), EncodeError> {
        self.reset();

        let mut current: Option<&LogRecordStream> = None;
        for record in batch {
            let same = matches!(current, Some(stream) if stream == record.stream().as_ref());
            if !same {
                self.request.streams.push(stream(record.stream()));
                current = Some(record.stream().as_ref());
            }

            if let Some(adapter) = self.request.streams.last_mut() {
                adapter.entries.push(entry(record));
            }
        }

        let len = self.request.encoded_len();
        reserve(&mut self.uncompressed, len);
        self.request.encode(&mut self.uncompressed)?;
        self.request.streams.clear();

        let max = snap::raw::max_compress_len(self.uncompressed.len());
        if self.compressed.len() < max {
            let grow = max.max(self.compressed.len() + self.compressed.len() / 2);
            self.compressed.resize(grow, 0);
        }
        self.size = self
            .encoder
            .compress(&self.uncompressed, &mut self.compressed)?;

        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn to_buffer(&mut self, buf: &mut dyn BufMut) {
        buf.put_slice(&self.compressed[..self.size]);
        self.reset();
    }

    fn reset(&mut self) {
        self.request.streams.clear();
        self.uncompressed.clear();
        self.size = 0;
    }
}
