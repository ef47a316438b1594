//! Configuration loading for the bridge (§6)

use crate::robot::pose::Pose;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub robot: RobotConfig,
    pub plc: PlcConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    pub transport: TransportKind,
    #[serde(rename = "serialPath")]
    pub serial_path: Option<String>,
    pub baud: Option<u32>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "velocityRatio")]
    pub velocity_ratio: Option<u8>,
    #[serde(rename = "accelerationRatio")]
    pub acceleration_ratio: Option<u8>,
    pub home: Pose,
    #[serde(default)]
    pub envelope: Envelope,
}

impl RobotConfig {
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(115_200)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(29999)
    }

    pub fn velocity_ratio(&self) -> u8 {
        self.velocity_ratio.unwrap_or(100).clamp(1, 100)
    }

    pub fn acceleration_ratio(&self) -> u8 {
        self.acceleration_ratio.unwrap_or(100).clamp(1, 100)
    }
}

/// Per-axis min/max bounding box (§3 Pose invariant, §6 `robot.envelope`).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct AxisRange {
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(default = "Envelope::default_xy")]
    pub x: AxisRange,
    #[serde(default = "Envelope::default_xy")]
    pub y: AxisRange,
    #[serde(default = "Envelope::default_z")]
    pub z: AxisRange,
    #[serde(default = "Envelope::default_r")]
    pub r: AxisRange,
}

impl Envelope {
    fn default_xy() -> AxisRange {
        AxisRange {
            min: -300.0,
            max: 300.0,
        }
    }

    fn default_z() -> AxisRange {
        AxisRange {
            min: -100.0,
            max: 400.0,
        }
    }

    fn default_r() -> AxisRange {
        AxisRange {
            min: -180.0,
            max: 180.0,
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            x: Self::default_xy(),
            y: Self::default_xy(),
            z: Self::default_z(),
            r: Self::default_r(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlcConfig {
    pub ip: String,
    pub rack: Option<u16>,
    pub slot: Option<u16>,
    #[serde(rename = "readTimeoutMs")]
    pub read_timeout_ms: Option<u64>,
    #[serde(rename = "reconnectCooldownMs")]
    pub reconnect_cooldown_ms: Option<u64>,
    #[serde(rename = "watchdogMs")]
    pub watchdog_ms: Option<u64>,
}

impl PlcConfig {
    pub fn rack(&self) -> u16 {
        self.rack.unwrap_or(0)
    }

    pub fn slot(&self) -> u16 {
        self.slot.unwrap_or(1)
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms.unwrap_or(5_000)
    }

    pub fn reconnect_cooldown_ms(&self) -> u64 {
        self.reconnect_cooldown_ms.unwrap_or(5_000)
    }

    pub fn watchdog_ms(&self) -> u64 {
        self.watchdog_ms.unwrap_or(10_000)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(rename = "pollIntervalMs")]
    pub poll_interval_ms: Option<u64>,
    #[serde(rename = "errorThreshold")]
    pub error_threshold: Option<u32>,
    #[serde(rename = "poseEpsilonMm")]
    pub pose_epsilon_mm: Option<f32>,
    #[serde(rename = "feedbackMaxHz")]
    pub feedback_max_hz: Option<u32>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: None,
            error_threshold: None,
            pose_epsilon_mm: None,
            feedback_max_hz: None,
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.unwrap_or(100)
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold.unwrap_or(3)
    }

    pub fn pose_epsilon_mm(&self) -> f32 {
        self.pose_epsilon_mm.unwrap_or(0.1)
    }

    pub fn feedback_max_hz(&self) -> u32 {
        self.feedback_max_hz.unwrap_or(20)
    }
}

impl Config {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("failed to read {}: {}", path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        Ok(config)
    }
}
