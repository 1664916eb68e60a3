//! Prometheus metrics for the teleport oracle
//!
//! Served as text on `/metrics` when the status API is enabled.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_int_gauge, Counter,
    CounterVec, Encoder, Histogram, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EVENTS_OBSERVED: Counter = register_counter!(
        "teleport_events_observed_total",
        "Source events delivered to the relay pipeline (including replays)"
    ).unwrap();

    pub static ref RELAY_OUTCOMES: CounterVec = register_counter_vec!(
        "teleport_relay_outcomes_total",
        "Terminal relay outcomes per source event",
        &["outcome"]
    ).unwrap();

    pub static ref DISPATCH_ATTEMPTS: CounterVec = register_counter_vec!(
        "teleport_dispatch_attempts_total",
        "Destination transfer attempts by result",
        &["result"]
    ).unwrap();

    pub static ref DISPATCH_DURATION: Histogram = register_histogram!(
        "teleport_dispatch_duration_seconds",
        "Time from first attempt to terminal dispatch outcome",
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref RECONNECTS: Counter = register_counter!(
        "teleport_source_reconnects_total",
        "Source subscription reconnects"
    ).unwrap();

    pub static ref LAST_DELIVERED_BLOCK: IntGauge = register_int_gauge!(
        "teleport_last_delivered_block",
        "Highest source block delivered by the subscriber"
    ).unwrap();

    pub static ref PENDING_RECORDS: IntGauge = register_int_gauge!(
        "teleport_pending_records",
        "Relay records left PENDING and awaiting reconciliation"
    ).unwrap();

    pub static ref UP: IntGauge = register_int_gauge!(
        "teleport_up",
        "Whether the relay pipeline is running"
    ).unwrap();
}

/// Record a terminal outcome (`skipped`, `issued`, `failed`)
pub fn record_outcome(outcome: &str) {
    RELAY_OUTCOMES.with_label_values(&[outcome]).inc();
}

/// Encode the default registry in the Prometheus text format
pub fn encode() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_relay_metrics() {
        record_outcome("issued");
        EVENTS_OBSERVED.inc();

        let (content_type, body) = encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("teleport_relay_outcomes_total"));
        assert!(text.contains("teleport_events_observed_total"));
    }
}
