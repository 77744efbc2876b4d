//! Device registry: the set of known devices and their polling state.
//!
//! The registry is the single synchronization point between the scheduling
//! loop, completing poll tasks and the HTTP control surface. All of them go
//! through one `Shared<DeviceRegistry>` lock, so a tick never iterates a
//! half-mutated set and register/deregister calls are serialized against
//! admission.
//!
//! Cancellation is epoch-based: every (re)registration gets a fresh epoch,
//! and a completion whose epoch no longer matches the registry entry is
//! discarded. The in-flight network call may still finish, but its result is
//! never recorded or ingested for a device that was deregistered meanwhile.

use crate::error::{RegistryError, TransportError};
use crate::transport::RawPollResult;
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    Failed(String),
}

/// One known device and its polling state. Mutated only under the registry
/// lock, by the scheduler and by explicit register/deregister calls.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub enabled: bool,
    pub interval_override: Option<Duration>,
    /// Registered through the ingestion path rather than explicitly.
    pub discovered: bool,
    /// Interface count reported by the last successful poll.
    pub interfaces: u32,
    pub last_polled: Option<OffsetDateTime>,
    pub last_outcome: Option<PollOutcome>,
    pub consecutive_failures: u32,
    pub next_poll: Instant,
    pub in_flight: bool,
    pub epoch: u64,
    pub registered_at: OffsetDateTime,
    /// Registration order, used as the admission tie-break.
    pub(crate) seq: u64,
}

/// Registration parameters beyond the device id.
#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub interval_override: Option<Duration>,
    pub discovered: bool,
}

/// Handle to one admitted poll. Carries the epoch so a completion racing a
/// deregistration can be told apart from a live one.
#[derive(Debug, Clone)]
pub struct PollTicket {
    pub device: String,
    pub epoch: u64,
}

/// Whether a poll completion was recorded or thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Discarded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryCounts {
    pub devices: usize,
    pub discovered: usize,
    pub interfaces: u64,
    pub in_flight: usize,
}

pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    in_flight: usize,
    seq: u64,
    epoch_seq: u64,
    fault: Option<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: HashMap::new(), in_flight: 0, seq: 0, epoch_seq: 0, fault: None }
    }

    pub fn register(&mut self, id: &str, spec: NewDevice, now: Instant) -> Result<(), RegistryError> {
        if self.devices.contains_key(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        self.seq += 1;
        self.epoch_seq += 1;
        self.devices.insert(
            id.to_string(),
            Device {
                id: id.to_string(),
                ip: spec.ip,
                hostname: spec.hostname,
                enabled: true,
                interval_override: spec.interval_override,
                discovered: spec.discovered,
                interfaces: 0,
                last_polled: None,
                last_outcome: None,
                consecutive_failures: 0,
                // due immediately: a fresh device is polled at the next tick
                next_poll: now,
                in_flight: false,
                epoch: self.epoch_seq,
                registered_at: OffsetDateTime::now_utc(),
                seq: self.seq,
            },
        );
        debug!(device = id, discovered = spec.discovered, "device registered");
        Ok(())
    }

    /// Registers the device if unseen (ingestion path auto-discovery) and
    /// refreshes metadata either way. Returns false when the device is
    /// unknown and discovery is off.
    pub fn ensure_registered(
        &mut self,
        id: &str,
        ip: Option<String>,
        hostname: Option<String>,
        allow_discovery: bool,
        now: Instant,
    ) -> bool {
        if let Some(dev) = self.devices.get_mut(id) {
            if ip.is_some() {
                dev.ip = ip;
            }
            if hostname.is_some() {
                dev.hostname = hostname;
            }
            return true;
        }
        if !allow_discovery {
            return false;
        }
        let spec = NewDevice { ip, hostname, discovered: true, ..NewDevice::default() };
        // id was just checked absent, so this cannot collide
        self.register(id, spec, now).is_ok()
    }

    /// Removes a device from the poll set. An outstanding task is cancelled:
    /// its in-flight slot is released now and its eventual completion will
    /// miss the epoch and be discarded.
    pub fn deregister(&mut self, id: &str) -> Result<Device, RegistryError> {
        let dev = self
            .devices
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if dev.in_flight {
            self.release_in_flight();
        }
        debug!(device = id, "device deregistered");
        Ok(dev)
    }

    /// Computes the due set and admits tasks up to the remaining concurrency
    /// budget. Due devices are taken earliest-due first, registration order
    /// breaking ties; devices not admitted stay due for the next tick since
    /// their due time does not advance while waiting.
    pub fn admit_due(&mut self, now: Instant, max_concurrent: usize) -> Vec<PollTicket> {
        let budget = max_concurrent.saturating_sub(self.in_flight);
        if budget == 0 {
            return Vec::new();
        }
        let mut due: Vec<(Instant, u64, String)> = self
            .devices
            .values()
            .filter(|d| d.enabled && !d.in_flight && d.next_poll <= now)
            .map(|d| (d.next_poll, d.seq, d.id.clone()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        due.truncate(budget);

        let mut tickets = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(dev) = self.devices.get_mut(&id) {
                dev.in_flight = true;
                self.in_flight += 1;
                tickets.push(PollTicket { device: id, epoch: dev.epoch });
            }
        }
        tickets
    }

    /// Records a poll completion. Success resets backoff and refreshes
    /// device metadata from the payload; failure bumps the consecutive
    /// failure count and pushes the next attempt out exponentially, capped.
    /// Completions for deregistered or re-registered devices are discarded.
    pub fn complete(
        &mut self,
        ticket: &PollTicket,
        result: Result<&RawPollResult, &TransportError>,
        now: Instant,
        base_interval: Duration,
        backoff_cap_multiplier: u32,
    ) -> Disposition {
        let Some(dev) = self.devices.get_mut(&ticket.device) else {
            return Disposition::Discarded;
        };
        if dev.epoch != ticket.epoch {
            return Disposition::Discarded;
        }
        if !dev.in_flight {
            warn!(device = %ticket.device, "completion for a device with no outstanding poll");
            return Disposition::Discarded;
        }
        dev.in_flight = false;
        let base = dev.interval_override.unwrap_or(base_interval);
        match result {
            Ok(raw) => {
                dev.consecutive_failures = 0;
                dev.last_outcome = Some(PollOutcome::Success);
                dev.next_poll = now + base;
                if let Some(hostname) = raw.hostname() {
                    dev.hostname = Some(hostname.to_string());
                }
                if let Some(ip) = raw.ip() {
                    dev.ip = Some(ip.to_string());
                }
                if let Some(n) = raw.interface_count() {
                    dev.interfaces = n;
                }
            }
            Err(err) => {
                dev.consecutive_failures = dev.consecutive_failures.saturating_add(1);
                dev.last_outcome = Some(PollOutcome::Failed(err.to_string()));
                dev.next_poll = now + backoff_delay(base, dev.consecutive_failures, backoff_cap_multiplier);
            }
        }
        dev.last_polled = Some(OffsetDateTime::now_utc());
        self.release_in_flight();
        Disposition::Applied
    }

    fn release_in_flight(&mut self) {
        match self.in_flight.checked_sub(1) {
            Some(v) => self.in_flight = v,
            None => {
                self.fault = Some("in-flight accounting went negative".to_string());
            }
        }
    }

    pub fn device(&self, id: &str) -> Result<&Device, RegistryError> {
        self.devices.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn snapshot(&self) -> Vec<Device> {
        let mut all: Vec<Device> = self.devices.values().cloned().collect();
        all.sort_by(|a, b| a.seq.cmp(&b.seq));
        all
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            devices: self.devices.len(),
            discovered: self.devices.values().filter(|d| d.discovered).count(),
            interfaces: self.devices.values().map(|d| d.interfaces as u64).sum(),
            in_flight: self.in_flight,
        }
    }

    /// Surfaces and clears a pending accounting fault, if any. The scheduler
    /// loop checks this each tick and latches into the fatal state.
    pub fn take_fault(&mut self) -> Option<String> {
        self.fault.take()
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry delay after `failures` consecutive failures: `base * 2^failures`,
/// capped at `base * cap_multiplier`.
pub fn backoff_delay(base: Duration, failures: u32, cap_multiplier: u32) -> Duration {
    let cap = cap_multiplier.max(1);
    let factor = if failures >= 31 { cap } else { (1u32 << failures).min(cap) };
    base * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(ids: &[&str], now: Instant) -> DeviceRegistry {
        let mut reg = DeviceRegistry::new();
        for id in ids {
            reg.register(id, NewDevice::default(), now).unwrap();
        }
        reg
    }

    fn ok_result() -> RawPollResult {
        RawPollResult::new(json!({"bytesIn": 1}))
    }

    #[test]
    fn admission_respects_cap_and_registration_order() {
        let now = Instant::now();
        let mut reg = registry_with(&["a", "b", "c"], now);

        let tickets = reg.admit_due(now, 2);
        let ids: Vec<_> = tickets.iter().map(|t| t.device.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(reg.counts().in_flight, 2);

        // c stays due; no budget left, and a/b must not be admitted twice
        assert!(reg.admit_due(now, 2).is_empty());
    }

    #[test]
    fn freed_slot_admits_the_waiting_device() {
        let now = Instant::now();
        let mut reg = registry_with(&["a", "b", "c"], now);
        let tickets = reg.admit_due(now, 2);

        let base = Duration::from_secs(10);
        let disp = reg.complete(&tickets[0], Ok(&ok_result()), now, base, 8);
        assert_eq!(disp, Disposition::Applied);

        let next = reg.admit_due(now, 2);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].device, "c");
        // a just succeeded, so it is not due again yet
        assert!(reg.admit_due(now, 4).is_empty());
    }

    #[test]
    fn deregister_cancels_outstanding_poll() {
        let now = Instant::now();
        let mut reg = registry_with(&["a"], now);
        let tickets = reg.admit_due(now, 1);
        assert_eq!(reg.counts().in_flight, 1);

        reg.deregister("a").unwrap();
        assert_eq!(reg.counts().in_flight, 0);

        let disp = reg.complete(&tickets[0], Ok(&ok_result()), now, Duration::from_secs(10), 8);
        assert_eq!(disp, Disposition::Discarded);
        assert!(reg.take_fault().is_none());
    }

    #[test]
    fn stale_epoch_after_re_registration_is_discarded() {
        let now = Instant::now();
        let mut reg = registry_with(&["a"], now);
        let stale = reg.admit_due(now, 1);

        reg.deregister("a").unwrap();
        reg.register("a", NewDevice::default(), now).unwrap();

        let disp = reg.complete(&stale[0], Ok(&ok_result()), now, Duration::from_secs(10), 8);
        assert_eq!(disp, Disposition::Discarded);
        let dev = reg.device("a").unwrap();
        assert!(!dev.in_flight);
        assert!(dev.last_polled.is_none());
    }

    #[test]
    fn failure_backs_off_and_success_resets() {
        let now = Instant::now();
        let base = Duration::from_secs(10);
        let mut reg = registry_with(&["a"], now);

        let t1 = reg.admit_due(now, 1);
        reg.complete(&t1[0], Err(&TransportError::Timeout), now, base, 8);
        let after_one = reg.device("a").unwrap().next_poll;
        assert_eq!(reg.device("a").unwrap().consecutive_failures, 1);
        assert_eq!(after_one, now + Duration::from_secs(20));

        let later = after_one;
        let t2 = reg.admit_due(later, 1);
        assert_eq!(t2.len(), 1);
        reg.complete(&t2[0], Err(&TransportError::Timeout), later, base, 8);
        assert_eq!(reg.device("a").unwrap().next_poll, later + Duration::from_secs(40));

        let t3 = reg.admit_due(later + Duration::from_secs(40), 1);
        reg.complete(&t3[0], Ok(&ok_result()), later + Duration::from_secs(40), base, 8);
        let dev = reg.device("a").unwrap();
        assert_eq!(dev.consecutive_failures, 0);
        assert_eq!(dev.next_poll, later + Duration::from_secs(50));
        assert_eq!(dev.last_outcome, Some(PollOutcome::Success));
    }

    #[test]
    fn backoff_grows_strictly_until_the_ceiling() {
        let base = Duration::from_secs(10);
        let mut previous = Duration::ZERO;
        for failures in 1..=3 {
            let delay = backoff_delay(base, failures, 8);
            assert!(delay > previous, "delay must grow through failure {failures}");
            previous = delay;
        }
        assert_eq!(backoff_delay(base, 3, 8), Duration::from_secs(80));
        assert_eq!(backoff_delay(base, 4, 8), Duration::from_secs(80));
        assert_eq!(backoff_delay(base, 40, 8), Duration::from_secs(80));
    }

    #[test]
    fn success_refreshes_device_metadata() {
        let now = Instant::now();
        let mut reg = registry_with(&["a"], now);
        let tickets = reg.admit_due(now, 1);
        let raw = RawPollResult::new(json!({
            "bytesIn": 5,
            "hostname": "gw-core",
            "ip": "192.168.88.1",
            "interfaces": ["ether1", "ether2", "wlan1"],
        }));
        reg.complete(&tickets[0], Ok(&raw), now, Duration::from_secs(10), 8);

        let dev = reg.device("a").unwrap();
        assert_eq!(dev.hostname.as_deref(), Some("gw-core"));
        assert_eq!(dev.ip.as_deref(), Some("192.168.88.1"));
        assert_eq!(dev.interfaces, 3);
        assert_eq!(reg.counts().interfaces, 3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let now = Instant::now();
        let mut reg = registry_with(&["a"], now);
        assert!(matches!(
            reg.register("a", NewDevice::default(), now),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn unknown_device_lookup_is_not_found() {
        let reg = DeviceRegistry::new();
        assert!(matches!(reg.device("nope"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn ensure_registered_honors_discovery_flag() {
        let now = Instant::now();
        let mut reg = DeviceRegistry::new();
        assert!(!reg.ensure_registered("x", None, None, false, now));
        assert_eq!(reg.counts().devices, 0);

        assert!(reg.ensure_registered("x", Some("10.0.0.9".into()), None, true, now));
        let counts = reg.counts();
        assert_eq!(counts.devices, 1);
        assert_eq!(counts.discovered, 1);
        assert!(reg.device("x").unwrap().discovered);
    }

    #[test]
    fn interval_override_drives_the_next_due_time() {
        let now = Instant::now();
        let mut reg = DeviceRegistry::new();
        let spec = NewDevice {
            interval_override: Some(Duration::from_secs(5)),
            ..NewDevice::default()
        };
        reg.register("fast", spec, now).unwrap();
        let tickets = reg.admit_due(now, 1);
        reg.complete(&tickets[0], Ok(&ok_result()), now, Duration::from_secs(60), 8);
        assert_eq!(reg.device("fast").unwrap().next_poll, now + Duration::from_secs(5));
    }
}
