//! Metric extraction from raw poll payloads.
//!
//! The management API reports per-device counters as a loose JSON object.
//! Extraction is deliberately lenient: a missing or non-numeric field counts
//! as 0, never an error. This telemetry is low stakes; a malformed payload
//! should degrade to zeroes rather than fail the poll.

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// Normalized traffic counters for one device sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

impl TrafficCounters {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// One immutable traffic observation, timestamped at ingestion.
#[derive(Debug, Clone)]
pub struct TrafficSample {
    pub device: String,
    pub at: Instant,
    pub counters: TrafficCounters,
}

/// Normalizes a raw poll payload into counters. Pure, no side effects.
pub fn extract_metrics(raw: &Value) -> TrafficCounters {
    TrafficCounters {
        bytes_in: counter(raw, "bytesIn"),
        bytes_out: counter(raw, "bytesOut"),
        packets_in: counter(raw, "packetsIn"),
        packets_out: counter(raw, "packetsOut"),
    }
}

fn counter(raw: &Value, key: &str) -> u64 {
    match raw.get(key) {
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_all_counters() {
        let raw = json!({"bytesIn": 100, "bytesOut": 50, "packetsIn": 7, "packetsOut": 3});
        let m = extract_metrics(&raw);
        assert_eq!(m.bytes_in, 100);
        assert_eq!(m.bytes_out, 50);
        assert_eq!(m.packets_in, 7);
        assert_eq!(m.packets_out, 3);
        assert_eq!(m.total_bytes(), 150);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let m = extract_metrics(&json!({"bytesIn": 42}));
        assert_eq!(m.bytes_in, 42);
        assert_eq!(m.bytes_out, 0);
        assert_eq!(m.packets_in, 0);
    }

    #[test]
    fn non_numeric_fields_are_zero_not_errors() {
        let raw = json!({"bytesIn": "lots", "bytesOut": null, "packetsIn": {"nested": 1}});
        assert_eq!(extract_metrics(&raw), TrafficCounters::default());
    }

    #[test]
    fn fractional_counters_are_truncated() {
        let m = extract_metrics(&json!({"bytesIn": 12.9, "bytesOut": -4.0}));
        assert_eq!(m.bytes_in, 12);
        assert_eq!(m.bytes_out, 0);
    }

    #[test]
    fn non_object_payload_is_all_zero() {
        assert_eq!(extract_metrics(&json!([1, 2, 3])), TrafficCounters::default());
    }
}
