//! Link configuration
//!
//! A `LinkConfig` is produced from an external configuration source,
//! handed to the interface factory once, and never modified afterwards.
//! Reconfiguring a link means building a new `LinkConfig`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::filter::{FilterRule, FilterSet};

/// Which adapter implements a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native controller (SocketCAN)
    #[serde(alias = "socketcan")]
    Hardware,
    /// Serial-to-CAN bridge (slcan)
    #[serde(alias = "slcan")]
    Bridge,
    /// Software loopback bus
    Virtual,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Hardware => "hardware",
            BackendKind::Bridge => "bridge",
            BackendKind::Virtual => "virtual",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardware" | "socketcan" => Ok(BackendKind::Hardware),
            "bridge" | "slcan" => Ok(BackendKind::Bridge),
            "virtual" => Ok(BackendKind::Virtual),
            other => Err(LinkError::UnsupportedBackend(format!(
                "unknown backend kind '{}'",
                other
            ))),
        }
    }
}

/// Configuration for one CAN link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Channel identifier (e.g. "can0", "/dev/ttyACM0", "vbus0")
    pub channel: String,
    /// CAN bus bitrate
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Adapter selection
    pub backend_kind: BackendKind,
    /// Acceptance filters, in order
    #[serde(default)]
    pub filters: FilterSet,
    /// How long `stop()` waits for the receive worker (milliseconds)
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
    /// Serial line speed for bridge adapters
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
    /// Virtual bus behaviour (ignored by other backends)
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_bitrate() -> u32 {
    500000
}

fn default_grace_period() -> u64 {
    2000
}

fn default_serial_baud() -> u32 {
    115200
}

impl LinkConfig {
    pub fn new(channel: impl Into<String>, bitrate: u32, backend_kind: BackendKind) -> Self {
        Self {
            channel: channel.into(),
            bitrate,
            backend_kind,
            filters: FilterSet::default(),
            grace_period_ms: default_grace_period(),
            serial_baud: default_serial_baud(),
            simulation: SimulationConfig::default(),
        }
    }

    /// Virtual bus at the default bitrate
    pub fn virtual_bus(channel: impl Into<String>) -> Self {
        Self::new(channel, default_bitrate(), BackendKind::Virtual)
    }

    pub fn with_filters(self, rules: Vec<FilterRule>) -> Self {
        Self {
            filters: FilterSet::new(rules),
            ..self
        }
    }

    pub fn with_simulation(self, simulation: SimulationConfig) -> Self {
        Self { simulation, ..self }
    }

    pub fn with_grace_period(self, grace_period: Duration) -> Self {
        Self {
            grace_period_ms: grace_period.as_millis() as u64,
            ..self
        }
    }

    pub fn with_serial_baud(self, serial_baud: u32) -> Self {
        Self {
            serial_baud,
            ..self
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Checks shared by every backend
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.channel.trim().is_empty() {
            return Err(LinkError::Configuration(
                "channel cannot be empty".to_string(),
            ));
        }
        if self.bitrate == 0 {
            return Err(LinkError::Configuration(
                "bitrate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Virtual bus simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Delay between accepting a frame and it appearing on the inbound queue
    #[serde(default)]
    pub send_latency_ms: u64,
    /// Delivery worker wake-up interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Probability in [0, 1] that a frame is dropped
    #[serde(default)]
    pub error_rate: f64,
    /// Capacity of each of the outbound and inbound queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Fixed RNG seed for reproducible error injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            send_latency_ms: 0,
            poll_interval_ms: default_poll_interval(),
            error_rate: 0.0,
            queue_capacity: default_queue_capacity(),
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn new(send_latency: Duration, poll_interval: Duration, error_rate: f64) -> Self {
        Self {
            send_latency_ms: send_latency.as_millis() as u64,
            poll_interval_ms: poll_interval.as_millis() as u64,
            error_rate,
            ..Self::default()
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }

    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    pub fn send_latency(&self) -> Duration {
        Duration::from_millis(self.send_latency_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(LinkError::Configuration(format!(
                "error_rate {} outside [0, 1]",
                self.error_rate
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(LinkError::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(LinkError::Configuration(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
