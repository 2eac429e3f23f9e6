//! Uptime monitors and probe results.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use meridian_proto::MonitorId;

/// Result classification of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Expected status (and body substring, if configured) observed.
    Up,
    /// Anything else, including timeouts and transport errors.
    Down,
}

impl ProbeStatus {
    /// The status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration and rolling state for one monitored endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeMonitor {
    /// Unique monitor id.
    pub id: MonitorId,
    /// Owning organisation.
    pub org_id: String,
    /// Display name.
    pub name: String,
    /// URL probed.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body, if any.
    pub body: Option<String>,
    /// Status code counted as up.
    pub expected_status_code: u16,
    /// Substring the response body must contain to count as up.
    pub expected_body_contains: Option<String>,
    /// Seconds between probes.
    pub interval_secs: u64,
    /// Hard probe timeout in seconds.
    pub timeout_secs: u64,
    /// Consecutive failures before an alert is raised.
    pub alert_after_failures: u32,
    /// Whether the monitor is probed.
    pub enabled: bool,
    /// Consecutive `down` results; reset to 0 on any `up`.
    pub consecutive_failures: u32,
    /// Most recent classification.
    pub last_status: Option<ProbeStatus>,
    /// When the monitor was last probed.
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl UptimeMonitor {
    /// A monitor with defaults for the given URL.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: MonitorId::generate(),
            org_id: "default".to_owned(),
            name: name.into(),
            url: url.into(),
            method: "GET".to_owned(),
            headers: BTreeMap::new(),
            body: None,
            expected_status_code: 200,
            expected_body_contains: None,
            interval_secs: 60,
            timeout_secs: 10,
            alert_after_failures: 3,
            enabled: true,
            consecutive_failures: 0,
            last_status: None,
            last_checked_at: None,
        }
    }

    /// Whether the monitor is due for a probe.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_checked_at {
            None => true,
            Some(last) => {
                now >= last + Duration::seconds(self.interval_secs.min(i64::MAX as u64) as i64)
            }
        }
    }
}

/// One immutable probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeCheck {
    /// Unique check id.
    pub id: String,
    /// Monitor that produced the check.
    pub monitor_id: MonitorId,
    /// Classification.
    pub status: ProbeStatus,
    /// HTTP status code, when a response arrived.
    pub status_code: Option<u16>,
    /// Round-trip time in milliseconds, when a response arrived.
    pub response_time_ms: Option<u64>,
    /// Transport or classification error detail.
    pub error_message: Option<String>,
    /// When the probe ran.
    pub created_at: DateTime<Utc>,
}

impl UptimeCheck {
    /// Record a probe result.
    #[must_use]
    pub fn new(
        monitor_id: MonitorId,
        status: ProbeStatus,
        status_code: Option<u16>,
        response_time_ms: Option<u64>,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            monitor_id,
            status,
            status_code,
            response_time_ms,
            error_message,
            created_at: Utc::now(),
        }
    }
}
