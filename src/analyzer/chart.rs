//! Presentational transform from aggregated traffic to a chart structure.
//!
//! The dashboard consumes a generic labeled time-series shape
//! (`{type, title, data: {labels, datasets}}`). This carries no invariants
//! beyond reflecting the aggregator state at call time.

use super::aggregator::TalkerTotals;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ChartData {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub data: ChartSeries,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartDataset {
    pub label: String,
    pub data: Vec<u64>,
}

/// Maps ranked talker totals to one label per device with in/out datasets.
pub fn build_traffic_chart(talkers: &[TalkerTotals]) -> ChartData {
    ChartData {
        kind: "barchart".into(),
        title: "Network Traffic".into(),
        data: ChartSeries {
            labels: talkers.iter().map(|t| t.device.clone()).collect(),
            datasets: vec![
                ChartDataset {
                    label: "Traffic In".into(),
                    data: talkers.iter().map(|t| t.bytes_in).collect(),
                },
                ChartDataset {
                    label: "Traffic Out".into(),
                    data: talkers.iter().map(|t| t.bytes_out).collect(),
                },
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_mirrors_talker_order() {
        let talkers = vec![
            TalkerTotals { device: "y".into(), bytes_in: 80, bytes_out: 90 },
            TalkerTotals { device: "x".into(), bytes_in: 100, bytes_out: 50 },
        ];
        let chart = build_traffic_chart(&talkers);
        assert_eq!(chart.data.labels, ["y", "x"]);
        assert_eq!(chart.data.datasets[0].data, [80, 100]);
        assert_eq!(chart.data.datasets[1].data, [90, 50]);
    }

    #[test]
    fn empty_aggregate_is_an_empty_chart() {
        let chart = build_traffic_chart(&[]);
        assert!(chart.data.labels.is_empty());
        assert_eq!(chart.data.datasets.len(), 2);
        assert!(chart.data.datasets[0].data.is_empty());
    }
}
