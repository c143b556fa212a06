use std::fmt::{Display, Formatter, Write as _};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;

/// Shared handle to an interned label set.
pub type StreamRef = Arc<LogRecordStream>;

/// A label set identifying a Loki stream.
///
/// Label order is significant, `{a="1",b="2"}` and `{b="2",a="1"}` are
/// different streams as far as batching and grouping go.
#[derive(Debug)]
pub struct LogRecordStream {
    labels: Vec<(String, String)>,
    hash: u64,
    utf8_bytes: usize,
}

impl LogRecordStream {
    pub fn new(labels: Vec<(String, String)>) -> Self {
        let mut hasher = DefaultHasher::new();
        labels.hash(&mut hasher);
        let hash = hasher.finish();

        let utf8_bytes = labels.iter().map(|(k, v)| k.len() + v.len()).sum();

        LogRecordStream {
            labels,
            hash,
            utf8_bytes,
        }
    }

    /// Builds a stream from `[k1, v1, k2, v2, ..]`. A dangling key gets an
    /// empty value.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = pairs.into_iter().map(Into::into);
        let mut labels = Vec::new();
        while let Some(key) = iter.next() {
            let value = iter.next().unwrap_or_default();
            labels.push((key, value));
        }

        Self::new(labels)
    }

    #[inline]
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    #[inline]
    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    /// Sum of the UTF-8 lengths of all keys and values.
    #[inline]
    pub fn utf8_bytes(&self) -> usize {
        self.utf8_bytes
    }

    /// Writes the Loki label selector form, `{k="v",k2="v2"}`, with `"` in
    /// values escaped.
    pub fn write_selector(&self, buf: &mut String) {
        buf.push('{');
        for (i, (key, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }

            buf.push_str(key);
            buf.push_str("=\"");
            for c in value.chars() {
                if c == '"' {
                    buf.push('\\');
                }
                buf.push(c);
            }
            buf.push('"');
        }
        buf.push('}');
    }

    pub fn selector(&self) -> String {
        let mut buf = String::with_capacity(self.utf8_bytes + 4 * self.labels.len() + 2);
        self.write_selector(&mut buf);
        buf
    }
}

impl PartialEq for LogRecordStream {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || (self.hash == other.hash && self.labels == other.labels)
    }
}

impl Eq for LogRecordStream {}

impl Hash for LogRecordStream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash)
    }
}

impl Display for LogRecordStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_char('{')?;
        for (i, (key, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            write!(f, "{key}={value:?}")?;
        }
        f.write_char('}')
    }
}

/// Deduplicates label sets, so records of one stream share a single
/// allocation and compare by pointer.
#[derive(Debug, Default)]
pub struct StreamInterner {
    streams: DashMap<String, StreamRef>,
}

impl StreamInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, labels: Vec<(String, String)>) -> StreamRef {
        let stream = LogRecordStream::new(labels);
        let key = stream.selector();

        if let Some(existing) = self.streams.get(&key) {
            return Arc::clone(existing.value());
        }

        Arc::clone(
            self.streams
                .entry(key)
                .or_insert_with(|| Arc::new(stream))
                .value(),
        )
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Largest sub-millisecond part of a timestamp, in nanoseconds.
pub const MAX_NANOS_IN_MS: u32 = 999_999;

/// A single log line ready to be shipped.
///
/// Records are immutable once built, the byte sizes used for batch
/// estimation are computed by the constructor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    timestamp_ms: i64,
    nanos_in_ms: u32,
    stream: StreamRef,
    message: String,
    metadata: IndexMap<String, String>,

    message_utf8_bytes: usize,
    metadata_utf8_bytes: usize,
}

impl LogRecord {
    pub fn new(timestamp_ms: i64, nanos_in_ms: u32, stream: StreamRef, message: impl Into<String>) -> Self {
        Self::with_metadata(timestamp_ms, nanos_in_ms, stream, message, IndexMap::new())
    }

    /// `nanos_in_ms` above [`MAX_NANOS_IN_MS`] is clamped to it.
    pub fn with_metadata(
        timestamp_ms: i64,
        nanos_in_ms: u32,
        stream: StreamRef,
        message: impl Into<String>,
        metadata: IndexMap<String, String>,
    ) -> Self {
        let nanos_in_ms = nanos_in_ms.min(MAX_NANOS_IN_MS);
        let message = message.into();
        let message_utf8_bytes = message.len();
        let metadata_utf8_bytes = metadata.iter().map(|(k, v)| k.len() + v.len()).sum();

        LogRecord {
            timestamp_ms,
            nanos_in_ms,
            stream,
            message,
            metadata,
            message_utf8_bytes,
            metadata_utf8_bytes,
        }
    }

    /// Milliseconds since the unix epoch.
    #[inline]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Sub-millisecond part of the timestamp, `0..=999_999`.
    #[inline]
    pub fn nanos_in_ms(&self) -> u32 {
        self.nanos_in_ms
    }

    #[inline]
    pub fn stream(&self) -> &StreamRef {
        &self.stream
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured metadata, in insertion order.
    #[inline]
    pub fn metadata(&self) -> &IndexMap<String, String> {
        &self.metadata
    }

    #[inline]
    pub fn message_utf8_bytes(&self) -> usize {
        self.message_utf8_bytes
    }

    #[inline]
    pub fn metadata_utf8_bytes(&self) -> usize {
        self.metadata_utf8_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn stream_sizes_and_equality() {
        let a = LogRecordStream::new(labels(&[("app", "my-app"), ("level", "INFO")]));
        let b = LogRecordStream::from_pairs(["app", "my-app", "level", "INFO"]);
        let c = LogRecordStream::new(labels(&[("level", "INFO"), ("app", "my-app")]));

        assert_eq!(a.utf8_bytes(), 3 + 6 + 5 + 4);
        assert_eq!(a, b);
        assert_eq!(a.hash_code(), b.hash_code());
        assert_ne!(a, c);

        let set = [a, b, c].into_iter().collect::<HashSet<_>>();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn selector_escapes_quotes() {
        let stream = LogRecordStream::new(labels(&[("job", "say \"hi\""), ("env", "prod")]));
        assert_eq!(stream.selector(), r#"{job="say \"hi\"",env="prod"}"#);

        assert_eq!(LogRecordStream::new(vec![]).selector(), "{}");
    }

    #[test]
    fn dangling_pair_key() {
        let stream = LogRecordStream::from_pairs(["a", "1", "b"]);
        assert_eq!(stream.labels(), &labels(&[("a", "1"), ("b", "")])[..]);
    }

    #[test]
    fn utf8_sizes() {
        let stream = Arc::new(LogRecordStream::from_pairs(["k", "v"]));
        let mut metadata = IndexMap::new();
        metadata.insert("trace".to_string(), "ü".to_string());

        let record = LogRecord::with_metadata(1, 0, stream, "héllo", metadata);
        assert_eq!(record.message_utf8_bytes(), 6);
        assert_eq!(record.metadata_utf8_bytes(), 5 + 2);
    }

    #[test]
    fn nanos_clamped() {
        let stream = Arc::new(LogRecordStream::from_pairs(["k", "v"]));

        let record = LogRecord::new(1999, 2_000_000_000, Arc::clone(&stream), "x");
        assert_eq!(record.nanos_in_ms(), MAX_NANOS_IN_MS);
        assert_eq!(record.timestamp_ms(), 1999);

        let record = LogRecord::new(1999, 42, stream, "x");
        assert_eq!(record.nanos_in_ms(), 42);
        assert_eq!(record.message(), "x");
        assert!(record.metadata().is_empty());
    }

    #[test]
    fn interner_shares_allocations() {
        let interner = StreamInterner::new();

        let a = interner.intern(labels(&[("app", "x")]));
        let b = interner.intern(labels(&[("app", "x")]));
        let c = interner.intern(labels(&[("app", "y")]));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(interner.len(), 2);
    }
}
