//! Kernel health snapshot for the HTTP surface.

use crate::scheduler::{LoopState, PollScheduler};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub scheduler_active: bool,
    /// "running", "stopped", or "fatal: <reason>" so monitoring can tell a
    /// clean stop from an invariant violation.
    pub scheduler_state: String,
    pub devices_tracked: u32,
    pub discovered_devices: u32,
    pub in_flight_polls: u32,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, scheduler: &PollScheduler) -> KernelHealth {
        let status = scheduler.status();
        let scheduler_state = match scheduler.loop_state() {
            LoopState::Running => "running".to_string(),
            LoopState::Stopped => "stopped".to_string(),
            LoopState::Fatal(reason) => format!("fatal: {reason}"),
        };
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            scheduler_active: status.active,
            scheduler_state,
            devices_tracked: status.devices as u32,
            discovered_devices: status.discovered_devices as u32,
            in_flight_polls: status.in_flight as u32,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0;
                        }
                    }
                }
            }
        }
    }

    0.0
}
