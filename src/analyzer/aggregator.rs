//! Top-talkers aggregation over a sliding time window.
//!
//! Each device keeps a deque of timestamped counter samples plus a running
//! total. Eviction is lazy: samples older than the window are popped and
//! subtracted when new data arrives or a query runs, so totals at query time
//! always cover exactly `[now - window, now]` and a sample is never counted
//! or evicted twice.

use super::metrics::TrafficSample;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    at: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

#[derive(Debug, Default)]
struct DeviceWindow {
    slots: VecDeque<WindowSlot>,
    bytes_in: u64,
    bytes_out: u64,
}

impl DeviceWindow {
    fn push(&mut self, slot: WindowSlot) {
        self.bytes_in = self.bytes_in.saturating_add(slot.bytes_in);
        self.bytes_out = self.bytes_out.saturating_add(slot.bytes_out);
        self.slots.push_back(slot);
    }

    fn evict_before(&mut self, cutoff: Instant) {
        while let Some(front) = self.slots.front() {
            if front.at >= cutoff {
                break;
            }
            self.bytes_in = self.bytes_in.saturating_sub(front.bytes_in);
            self.bytes_out = self.bytes_out.saturating_sub(front.bytes_out);
            self.slots.pop_front();
        }
    }
}

/// Aggregated totals for one device over the current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkerTotals {
    pub device: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TalkerTotals {
    pub fn total(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// Rolling ranked view of devices by traffic volume.
pub struct TopTalkersAggregator {
    windows: HashMap<String, DeviceWindow>,
    window: Duration,
}

impl TopTalkersAggregator {
    pub fn new(window: Duration) -> Self {
        Self { windows: HashMap::new(), window }
    }

    /// Adds a sample to the device's running total and evicts anything that
    /// fell out of the window. Per-device timestamps are kept monotonically
    /// non-decreasing by clamping to the newest slot.
    pub fn ingest(&mut self, sample: &TrafficSample) {
        let win = self.windows.entry(sample.device.clone()).or_default();
        let at = match win.slots.back() {
            Some(back) if back.at > sample.at => back.at,
            _ => sample.at,
        };
        win.push(WindowSlot {
            at,
            bytes_in: sample.counters.bytes_in,
            bytes_out: sample.counters.bytes_out,
        });
        let cutoff = at.checked_sub(self.window).unwrap_or(at);
        if at > cutoff {
            win.evict_before(cutoff);
        }
    }

    /// Ranked top-N by `bytes_in + bytes_out` descending; ties break on
    /// ascending device id so repeated calls over identical data agree.
    /// `limit <= 0` yields nothing; a limit beyond the known device count
    /// returns every known device exactly once.
    pub fn top_talkers(&mut self, limit: i64, now: Instant) -> Vec<TalkerTotals> {
        if limit <= 0 {
            return Vec::new();
        }
        if let Some(cutoff) = now.checked_sub(self.window) {
            for win in self.windows.values_mut() {
                win.evict_before(cutoff);
            }
        }
        let mut ranked: Vec<TalkerTotals> = self
            .windows
            .iter()
            .map(|(id, win)| TalkerTotals {
                device: id.clone(),
                bytes_in: win.bytes_in,
                bytes_out: win.bytes_out,
            })
            .collect();
        ranked.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.device.cmp(&b.device)));
        ranked.truncate(limit as usize);
        ranked
    }

    /// Drops all window state for a device (deregistration).
    pub fn forget(&mut self, device: &str) {
        self.windows.remove(device);
    }

    pub fn device_count(&self) -> usize {
        self.windows.len()
    }
}
