//! Traffic analyzer: metric extraction plus top-talkers aggregation.
//!
//! The facade is what the scheduler and the HTTP surface talk to. Samples
//! arrive from completing poll tasks (any task, any order across devices)
//! and from the external ingestion endpoint; the aggregator sits behind one
//! mutex so `parse_traffic_data` is safe to call concurrently.

pub mod aggregator;
pub mod chart;
pub mod metrics;

use crate::state::{new_state, Shared};
use aggregator::{TalkerTotals, TopTalkersAggregator};
use chart::{build_traffic_chart, ChartData};
use metrics::{extract_metrics, TrafficSample};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct TrafficAnalyzer {
    agg: Shared<TopTalkersAggregator>,
}

impl TrafficAnalyzer {
    pub fn new(window: Duration) -> Self {
        Self { agg: new_state(TopTalkersAggregator::new(window)) }
    }

    /// Extracts counters from a raw payload and ingests them in one call.
    /// Returns the sample that was recorded.
    pub fn parse_traffic_data(&self, device: &str, raw: &Value, now: Instant) -> TrafficSample {
        let sample = TrafficSample {
            device: device.to_string(),
            at: now,
            counters: extract_metrics(raw),
        };
        self.agg.lock().ingest(&sample);
        sample
    }

    pub fn top_talkers(&self, limit: i64, now: Instant) -> Vec<TalkerTotals> {
        self.agg.lock().top_talkers(limit, now)
    }

    /// Chart transform over the current ranking; presentational only.
    pub fn traffic_chart(&self, now: Instant) -> ChartData {
        let talkers = self.agg.lock().top_talkers(i64::MAX, now);
        build_traffic_chart(&talkers)
    }

    pub fn forget(&self, device: &str) {
        self.agg.lock().forget(device);
    }
}
