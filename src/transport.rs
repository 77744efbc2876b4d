//! Device transport: how the kernel reaches devices for a poll.
//!
//! The wire protocol for talking to routers is outside the kernel's scope,
//! so polling goes through the `DeviceTransport` seam. The stock
//! implementation polls a management REST API; tests plug in scripted
//! transports.

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Raw per-device payload as returned by one poll. Counter extraction is
/// lenient (see `analyzer::metrics`); the metadata accessors here are just
/// as lenient and return `None` for anything absent or mistyped.
#[derive(Debug, Clone)]
pub struct RawPollResult {
    data: Value,
}

impl RawPollResult {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn counters(&self) -> &Value {
        &self.data
    }

    pub fn hostname(&self) -> Option<&str> {
        self.data.get("hostname").and_then(Value::as_str)
    }

    pub fn ip(&self) -> Option<&str> {
        self.data.get("ip").and_then(Value::as_str)
    }

    /// Interface count, accepting either a number or a list of interfaces.
    pub fn interface_count(&self) -> Option<u32> {
        match self.data.get("interfaces") {
            Some(Value::Array(list)) => Some(list.len() as u32),
            Some(v) => v.as_u64().map(|n| n as u32),
            None => None,
        }
    }
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn poll(&self, device: &str) -> Result<RawPollResult, TransportError>;
}

/// Polls devices through the management REST API
/// (`GET {base}/devices/{id}/traffic`).
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    async fn poll(&self, device: &str) -> Result<RawPollResult, TransportError> {
        let url = format!("{}/devices/{}/traffic", self.base_url, device);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("{url} returned {}", resp.status())));
        }
        let data = resp.json::<Value>().await?;
        Ok(RawPollResult::new(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_accessors_are_lenient() {
        let raw = RawPollResult::new(json!({"hostname": 42, "ip": "10.0.0.1"}));
        assert_eq!(raw.hostname(), None);
        assert_eq!(raw.ip(), Some("10.0.0.1"));
        assert_eq!(raw.interface_count(), None);
    }

    #[test]
    fn interface_count_accepts_number_or_list() {
        assert_eq!(RawPollResult::new(json!({"interfaces": 4})).interface_count(), Some(4));
        assert_eq!(
            RawPollResult::new(json!({"interfaces": ["ether1", "wlan1"]})).interface_count(),
            Some(2)
        );
        assert_eq!(RawPollResult::new(json!({"interfaces": "many"})).interface_count(), None);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let t = HttpTransport::new("http://router.local/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(t.base_url, "http://router.local/api");
    }
}
