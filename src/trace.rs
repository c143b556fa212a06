use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `levels`, an `EnvFilter` directive
/// such as `info,lokiship=debug`. `RUST_LOG` wins when set.
///
/// Returns false when a global subscriber is installed already.
pub fn init(levels: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(levels))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
pub fn test_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Renders a payload for trace output, text as is, binary as base64.
pub(crate) fn payload_preview(payload: &[u8], binary: bool) -> String {
    use base64::prelude::{BASE64_STANDARD, Engine as _};

    if binary {
        BASE64_STANDARD.encode(payload)
    } else {
        String::from_utf8_lossy(payload).into_owned()
    }
}
