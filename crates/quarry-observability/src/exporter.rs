use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Content type of the Prometheus text exposition format
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Encode every registered metric family in the text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
