//! Device poll scheduler.
//!
//! A single driver loop wakes every `polling_interval_secs`, reads the
//! mutable config at the tick boundary, admits due devices up to the
//! concurrency cap and spawns one task per admitted poll. Poll tasks run
//! independently: each races the transport against the poll deadline,
//! records the outcome in the registry and, when the completion is still
//! current, feeds the sample to the traffic analyzer.
//!
//! Configuration changes never pre-empt the current wait; they are picked up
//! at the next tick. Per-device transport errors only touch that device's
//! status and backoff. An accounting fault latches the loop into a fatal
//! state that is visible as `active: false` until an explicit re-initialize.

use crate::analyzer::TrafficAnalyzer;
use crate::config::{validate_max_concurrent, validate_polling_interval, SchedulerConfig};
use crate::devices::{Device, DeviceRegistry, Disposition, NewDevice, PollTicket};
use crate::error::{ConfigError, RegistryError, TransportError};
use crate::state::{new_state, Shared};
use crate::transport::DeviceTransport;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Fatal(String),
}

/// Outcome of `initialize`: starting twice is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Started,
    AlreadyRunning,
}

/// Aggregate snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub active: bool,
    pub devices: usize,
    pub in_flight: usize,
    pub discovered_devices: usize,
    pub interfaces: u64,
}

#[derive(Clone)]
pub struct PollScheduler {
    registry: Shared<DeviceRegistry>,
    config: Shared<SchedulerConfig>,
    analyzer: TrafficAnalyzer,
    transport: Arc<dyn DeviceTransport>,
    state: Shared<LoopState>,
    /// Bumped on every (re)initialize; a loop whose generation is stale
    /// exits at its next tick, so a stop/start cycle never leaves two
    /// drivers admitting polls.
    generation: Arc<AtomicU64>,
}

impl PollScheduler {
    pub fn new(
        registry: Shared<DeviceRegistry>,
        config: Shared<SchedulerConfig>,
        analyzer: TrafficAnalyzer,
        transport: Arc<dyn DeviceTransport>,
    ) -> Self {
        Self {
            registry,
            config,
            analyzer,
            transport,
            state: new_state(LoopState::Stopped),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts the scheduling loop. Idempotent: a second call while running
    /// reports `AlreadyRunning`. From the fatal state this clears the fault
    /// and restarts.
    pub fn initialize(&self) -> InitOutcome {
        let gen;
        {
            let mut st = self.state.lock();
            if *st == LoopState::Running {
                info!("scheduler already initialized");
                return InitOutcome::AlreadyRunning;
            }
            if let LoopState::Fatal(reason) = &*st {
                info!(%reason, "re-initializing scheduler after fatal stop");
            }
            self.registry.lock().clear_fault();
            gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *st = LoopState::Running;
        }
        let sched = self.clone();
        tokio::spawn(async move { sched.run_loop(gen).await });
        InitOutcome::Started
    }

    /// Stops the loop at its next tick. Returns false when it was not
    /// running.
    pub fn shutdown(&self) -> bool {
        let mut st = self.state.lock();
        if *st == LoopState::Running {
            *st = LoopState::Stopped;
            info!("scheduler shutdown requested");
            true
        } else {
            false
        }
    }

    /// Applied on the next tick; rejects non-positive intervals with the
    /// prior value left in effect.
    pub fn set_polling_interval(&self, seconds: i64) -> Result<(), ConfigError> {
        let secs = validate_polling_interval(seconds)?;
        self.config.lock().polling_interval_secs = secs;
        info!(seconds = secs, "polling interval updated");
        Ok(())
    }

    pub fn set_max_concurrent_devices(&self, n: i64) -> Result<(), ConfigError> {
        let cap = validate_max_concurrent(n)?;
        self.config.lock().max_concurrent_devices = cap;
        info!(max = cap, "concurrency cap updated");
        Ok(())
    }

    pub fn set_auto_discovery(&self, enabled: bool) {
        self.config.lock().auto_discovery_enabled = enabled;
        info!(enabled, "auto-discovery toggled");
    }

    pub fn register_device(&self, id: &str, spec: NewDevice) -> Result<(), RegistryError> {
        self.registry.lock().register(id, spec, Instant::now())
    }

    /// Deregisters and cancels any outstanding poll for the device; its
    /// window state is dropped from the analyzer as well.
    pub fn deregister_device(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.lock().deregister(id)?;
        self.analyzer.forget(id);
        Ok(())
    }

    /// Ingestion-path lookup: known devices are refreshed, unknown ones are
    /// auto-registered when discovery is enabled. Returns false when the
    /// device stays unknown.
    pub fn ensure_known(&self, id: &str, ip: Option<String>, hostname: Option<String>) -> bool {
        let allow = self.config.lock().auto_discovery_enabled;
        self.registry.lock().ensure_registered(id, ip, hostname, allow, Instant::now())
    }

    pub fn device_polling_status(&self, id: &str) -> Result<Device, RegistryError> {
        self.registry.lock().device(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.lock().snapshot()
    }

    pub fn status(&self) -> SchedulerStatus {
        let active = *self.state.lock() == LoopState::Running;
        let counts = self.registry.lock().counts();
        SchedulerStatus {
            active,
            devices: counts.devices,
            in_flight: counts.in_flight,
            discovered_devices: counts.discovered,
            interfaces: counts.interfaces,
        }
    }

    pub fn loop_state(&self) -> LoopState {
        self.state.lock().clone()
    }

    async fn run_loop(&self, gen: u64) {
        let mut period = Duration::from_secs(self.config.lock().polling_interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        info!(interval_secs = period.as_secs(), "scheduler loop started");

        loop {
            ticker.tick().await;

            if self.generation.load(Ordering::SeqCst) != gen
                || *self.state.lock() != LoopState::Running
            {
                info!("scheduler loop exiting");
                return;
            }
            if let Some(reason) = self.registry.lock().take_fault() {
                warn!(%reason, "scheduler entering fatal state");
                let mut st = self.state.lock();
                if self.generation.load(Ordering::SeqCst) == gen {
                    *st = LoopState::Fatal(reason);
                }
                return;
            }

            // config is read once per tick; changes apply from here on
            let cfg = self.config.lock().clone();
            let new_period = Duration::from_secs(cfg.polling_interval_secs);
            if new_period != period {
                info!(
                    old_secs = period.as_secs(),
                    new_secs = new_period.as_secs(),
                    "polling interval change takes effect"
                );
                period = new_period;
                ticker = interval_at(Instant::now() + period, period);
            }

            let now = Instant::now();
            let tickets = self.registry.lock().admit_due(now, cfg.max_concurrent_devices);
            if tickets.is_empty() {
                continue;
            }
            debug!(admitted = tickets.len(), "tick admitted polls");

            let base = Duration::from_secs(cfg.polling_interval_secs);
            let deadline = Duration::from_secs(cfg.poll_timeout_secs);
            for ticket in tickets {
                let sched = self.clone();
                let cap = cfg.backoff_cap_multiplier;
                tokio::spawn(async move {
                    sched.execute_poll(ticket, deadline, base, cap).await;
                });
            }
        }
    }

    async fn execute_poll(
        &self,
        ticket: PollTicket,
        deadline: Duration,
        base_interval: Duration,
        backoff_cap: u32,
    ) {
        let task_id = Uuid::new_v4();
        debug!(%task_id, device = %ticket.device, "poll task started");

        let result = match timeout(deadline, self.transport.poll(&ticket.device)).await {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout),
        };

        let now = Instant::now();
        let disposition = {
            let mut reg = self.registry.lock();
            match &result {
                Ok(raw) => reg.complete(&ticket, Ok(raw), now, base_interval, backoff_cap),
                Err(e) => reg.complete(&ticket, Err(e), now, base_interval, backoff_cap),
            }
        };

        match (disposition, result) {
            (Disposition::Applied, Ok(raw)) => {
                let sample = self.analyzer.parse_traffic_data(&ticket.device, raw.counters(), now);
                debug!(
                    %task_id,
                    device = %ticket.device,
                    bytes = sample.counters.total_bytes(),
                    "poll succeeded"
                );
            }
            (Disposition::Applied, Err(e)) => {
                warn!(%task_id, device = %ticket.device, error = %e, "poll failed");
            }
            (Disposition::Discarded, _) => {
                debug!(%task_id, device = %ticket.device, "poll result discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawPollResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullTransport;

    #[async_trait]
    impl DeviceTransport for NullTransport {
        async fn poll(&self, _device: &str) -> Result<RawPollResult, TransportError> {
            Ok(RawPollResult::new(json!({})))
        }
    }

    fn scheduler() -> PollScheduler {
        PollScheduler::new(
            new_state(DeviceRegistry::new()),
            new_state(SchedulerConfig::default()),
            TrafficAnalyzer::new(Duration::from_secs(300)),
            Arc::new(NullTransport),
        )
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let sched = scheduler();
        assert_eq!(sched.initialize(), InitOutcome::Started);
        assert_eq!(sched.initialize(), InitOutcome::AlreadyRunning);
        assert!(sched.status().active);
        assert!(sched.shutdown());
        assert!(!sched.shutdown());
    }

    #[tokio::test]
    async fn invalid_interval_leaves_config_untouched() {
        let sched = scheduler();
        assert!(sched.set_polling_interval(-5).is_err());
        assert_eq!(sched.config.lock().polling_interval_secs, 60);

        sched.set_polling_interval(30).unwrap();
        assert_eq!(sched.config.lock().polling_interval_secs, 30);
    }

    #[tokio::test]
    async fn invalid_cap_leaves_config_untouched() {
        let sched = scheduler();
        assert!(sched.set_max_concurrent_devices(0).is_err());
        assert_eq!(sched.config.lock().max_concurrent_devices, 10);
    }

    #[tokio::test]
    async fn deregister_unknown_device_is_not_found() {
        let sched = scheduler();
        assert!(matches!(sched.deregister_device("ghost"), Err(RegistryError::NotFound(_))));
    }
}
