use std::io::Write as _;

use bytes::BufMut;

use super::{EncodeError, Writer, reserve};
use crate::batch::LogRecordBatch;
use crate::record::{LogRecord, LogRecordStream};

/// Writes the JSON flavour of a push request
///
/// ```json
/// {"streams":[{"stream":{"app":"x"},"values":[["1700000000000000000","line",{"trace_id":"abc"}]]}]}
/// ```
///
/// Timestamps are nanosecond strings, the metadata object is only written
/// for records that carry some.
pub struct JsonWriter {
    buf: Vec<u8>,
}

impl JsonWriter {
    pub fn new(capacity: usize) -> Self {
        JsonWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn stream(&mut self, stream: &LogRecordStream) -> Result<(), EncodeError> {
        reserve(&mut self.buf, stream.utf8_bytes() + 32);

        self.buf.extend_from_slice(br#"{"stream":{"#);
        for (i, (key, value)) in stream.labels().iter().enumerate() {
            if i > 0 {
                self.buf.push(b',');
            }
            serde_json::to_writer(&mut self.buf, key)?;
            self.buf.push(b':');
            serde_json::to_writer(&mut self.buf, value)?;
        }
        self.buf.extend_from_slice(br#"},"values":["#);

        Ok(())
    }

    fn record(&mut self, record: &LogRecord) -> Result<(), EncodeError> {
        reserve(
            &mut self.buf,
            record.message_utf8_bytes() + record.metadata_utf8_bytes() + 40,
        );

        // writing into a Vec never fails
        let _ = write!(
            self.buf,
            "[\"{}{:06}\",",
            record.timestamp_ms(), record.nanos_in_ms()
        );
        serde_json::to_writer(&mut self.buf, record.message())?;

        if !record.metadata().is_empty() {
            self.buf.push(b',');
            serde_json::to_writer(&mut self.buf, record.metadata())?;
        }

        self.buf.push(b']');

        Ok(())
    }
}

impl Writer for JsonWriter {
    fn is_binary(&self) -> bool {
        false
    }

    fn serialize_batch(&mut self, batch: &LogRecordBatch) -> Result<(), EncodeError> {
        self.buf.clear();
        self.buf.extend_from_slice(br#"{"streams":["#);

        let mut current: Option<&LogRecordStream> = None;
        for record in batch {
            match current {
                Some(stream) if stream == record.stream().as_ref() => self.buf.push(b','),
                Some(_) => {
                    self.buf.extend_from_slice(b"]},");
                    self.stream(record.stream())?;
                }
                None => self.stream(record.stream())?,
            }

            current = Some(record.stream().as_ref());
            self.record(record)?;
        }

        if current.is_some() {
            self.buf.extend_from_slice(b"]}");
        }
        self.buf.extend_from_slice(b"]}");

        Ok(())
    }

    fn size(&self) -> usize {
        self.buf.len()
    }

    fn to_buffer(&mut self, buf: &mut dyn BufMut) {
        buf.put_slice(&self.buf);
        self.reset();
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::batch::BatchCondition;

    fn batch(records: Vec<LogRecord>) -> LogRecordBatch {
        let mut batch = LogRecordBatch::new(records.len());
        let mut records = records;
        batch
            .init_from(&mut records, 0, BatchCondition::Unknown, 0, 1)
            .unwrap();
        batch
    }

    fn encode(batch: &LogRecordBatch) -> String {
        let mut writer = JsonWriter::new(16);
        writer.serialize_batch(batch).unwrap();
        String::from_utf8(writer.to_vec()).unwrap()
    }

    #[test]
    fn groups_consecutive_streams() {
        let a = Arc::new(LogRecordStream::from_pairs(["level", "INFO", "app", "my-app"]));
        let b = Arc::new(LogRecordStream::from_pairs(["level", "DEBUG", "app", "my-app"]));

        let batch = batch(vec![
            LogRecord::new(3000, 0, Arc::clone(&a), "l=INFO c=test.TestApp t=thread-1 | Test message 1"),
            LogRecord::new(3002, 0, Arc::clone(&a), "l=INFO c=test.TestApp t=thread-2 | Test message 3"),
            LogRecord::new(3001, 0, Arc::clone(&b), "l=DEBUG c=test.TestApp t=thread-1 | Test message 2"),
        ]);

        assert_eq!(
            encode(&batch),
            concat!(
                r#"{"streams":["#,
                r#"{"stream":{"level":"INFO","app":"my-app"},"values":["#,
                r#"["3000000000","l=INFO c=test.TestApp t=thread-1 | Test message 1"],"#,
                r#"["3002000000","l=INFO c=test.TestApp t=thread-2 | Test message 3"]]},"#,
                r#"{"stream":{"level":"DEBUG","app":"my-app"},"values":["#,
                r#"["3001000000","l=DEBUG c=test.TestApp t=thread-1 | Test message 2"]]}"#,
                r#"]}"#
            )
        );
    }

    #[test]
    fn two_stream_blocks_for_grouped_runs() {
        let a = Arc::new(LogRecordStream::from_pairs(["app", "a"]));
        let b = Arc::new(LogRecordStream::from_pairs(["app", "b"]));

        for order in [[&a, &a, &a, &b], [&b, &a, &a, &a]] {
            let records = order
                .iter()
                .enumerate()
                .map(|(i, s)| LogRecord::new(i as i64, 0, Arc::clone(s), format!("m{i}")))
                .collect();
            let encoded = encode(&batch(records));

            let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
            let blocks = value["streams"]
                .as_array()
                .unwrap()
                .iter()
                .map(|s| {
                    (
                        s["stream"]["app"].as_str().unwrap().to_string(),
                        s["values"].as_array().unwrap().len(),
                    )
                })
                .collect::<Vec<_>>();

            assert_eq!(blocks.len(), 2);
            assert!(blocks.contains(&("a".to_string(), 3)));
            assert!(blocks.contains(&("b".to_string(), 1)));
        }
    }

    #[test]
    fn nanos_and_metadata() {
        let s = Arc::new(LogRecordStream::from_pairs(["app", "x"]));
        let mut metadata = IndexMap::new();
        metadata.insert("trace_id".to_string(), "abc".to_string());
        metadata.insert("span".to_string(), "1".to_string());

        let batch = batch(vec![LogRecord::with_metadata(
            1700000000123,
            42,
            s,
            "hello",
            metadata,
        )]);

        assert_eq!(
            encode(&batch),
            r#"{"streams":[{"stream":{"app":"x"},"values":[["1700000000123000042","hello",{"trace_id":"abc","span":"1"}]]}]}"#
        );
    }

    #[test]
    fn escapes_strings() {
        let s = Arc::new(LogRecordStream::from_pairs(["q\"k", "v\\"]));
        let batch = batch(vec![LogRecord::new(
            0,
            0,
            s,
            "tab\there\nnew \u{1} \u{8}\u{c}\r \"ü€\"",
        )]);

        assert_eq!(
            encode(&batch),
            r#"{"streams":[{"stream":{"q\"k":"v\\"},"values":[["0000000","tab\there\nnew \u0001 \b\f\r \"ü€\""]]}]}"#
        );
    }

    #[test]
    fn empty_batch() {
        assert_eq!(encode(&LogRecordBatch::new(1)), r#"{"streams":[]}"#);
    }

    #[test]
    fn reuse_after_extract() {
        let s = Arc::new(LogRecordStream::from_pairs(["app", "x"]));
        let batch = batch(vec![LogRecord::new(1, 0, s, "m")]);

        let mut writer = JsonWriter::new(4);
        writer.serialize_batch(&batch).unwrap();
        let size = writer.size();
        assert!(!writer.is_empty());

        let mut out = bytes::BytesMut::new();
        writer.to_buffer(&mut out);
        assert_eq!(out.len(), size);
        assert!(writer.is_empty());

        writer.serialize_batch(&batch).unwrap();
        assert_eq!(writer.to_vec(), out.to_vec());
    }
}
