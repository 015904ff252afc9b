// Serial defaults and controller configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::{MotorFamily, OperatingMode};

// Serial port of the U2D2 adapter
pub const DEVICE_NAME: &str = "/dev/ttyUSB0";

pub const BAUDRATE: u32 = 57_600;

pub const PROTOCOL_VERSION: u8 = 2;

// Encoder units within which present position counts as "reached"
pub const MOVING_STATUS_THRESHOLD: i32 = 20;

// Per-transaction read timeout on the serial link
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// How the motion wait loop polls.
///
/// The default has no interval and no deadline: the loop spins on the bus
/// until the motor reports the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub poll_interval_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
}

impl WaitPolicy {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything needed to bring up a controller on one adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub port: String,
    pub protocol_version: u8,
    pub baudrate: u32,
    pub family: MotorFamily,
    pub operating_mode: OperatingMode,
    pub moving_threshold: i32,
    /// Written to every motor on registration unless it is being centered
    pub homing_offset: Option<i32>,
    pub wait: WaitPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: DEVICE_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            baudrate: BAUDRATE,
            family: MotorFamily::XSeries,
            operating_mode: OperatingMode::ExtendedPosition,
            moving_threshold: MOVING_STATUS_THRESHOLD,
            homing_offset: None,
            wait: WaitPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baudrate, 57_600);
        assert_eq!(config.protocol_version, 2);
        assert_eq!(config.moving_threshold, 20);
        assert_eq!(config.family, MotorFamily::XSeries);
        assert_eq!(config.operating_mode, OperatingMode::ExtendedPosition);
        assert_eq!(config.wait.deadline(), None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "port": "/dev/ttyUSB1",
            "family": "pro_series",
            "operating_mode": "position",
            "wait": { "poll_interval_ms": 5 }
        }"#;
        let config: ControllerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB1");
        assert_eq!(config.family, MotorFamily::ProSeries);
        assert_eq!(config.operating_mode, OperatingMode::Position);
        assert_eq!(config.baudrate, BAUDRATE);
        assert_eq!(config.wait.poll_interval(), Some(Duration::from_millis(5)));
        assert_eq!(config.wait.deadline(), None);
    }
}
