//! Telemetry abstraction, shared across the Robot Driver, PLC Driver, and
//! Bridge so that reporting pose/state/event data outward never couples a
//! component to a specific transport (§2 ambient concern).

use crate::plc::StatusCode;
use crate::robot::Pose;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Robot pose as reported outward, with connection/safety flags alongside
/// it so a subscriber never has to join two separate streams to know
/// whether the pose is trustworthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionData {
    pub pose: Pose,
    pub timestamp: f64,
    pub robot_connected: bool,
    pub emergency_stopped: bool,
}

/// Bridge/robot state data for telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotStateData {
    pub status: StatusCode,
    pub bridge_state: String,
    pub timestamp: f64,
    pub robot_connected: bool,
    pub plc_connected: bool,
}

/// A single dispatched command, for auditing edge-triggered dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEventData {
    pub command: String,
    pub queue_index: Option<u32>,
    pub success: bool,
    pub message: Option<String>,
    pub timestamp: f64,
}

/// Publishes robot/bridge telemetry data to any transport, without this
/// crate being coupled to one.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    /// Publish robot pose/position data
    async fn publish_pose(&self, data: &PositionData) -> anyhow::Result<()>;

    /// Publish robot/bridge state information
    async fn publish_state(&self, data: &RobotStateData) -> anyhow::Result<()>;

    /// Publish a dispatched command event
    async fn publish_command(&self, data: &CommandEventData) -> anyhow::Result<()>;

    /// Optional: Publish custom telemetry data
    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        // Default implementation does nothing
        let _ = (topic, data);
        Ok(())
    }
}

/// No-operation telemetry publisher
/// 
/// Default implementation that discards all telemetry data.
/// Used when no telemetry is desired.
#[derive(Debug, Clone)]
pub struct NoOpTelemetry;

#[async_trait]
impl TelemetryPublisher for NoOpTelemetry {
    async fn publish_pose(&self, _data: &PositionData) -> anyhow::Result<()> {
        Ok(())
    }
    
    async fn publish_state(&self, _data: &RobotStateData) -> anyhow::Result<()> {
        Ok(())
    }
    
    async fn publish_command(&self, _data: &CommandEventData) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Console telemetry publisher for debugging
/// 
/// Prints all telemetry data to stdout in JSON format.
#[derive(Debug, Clone)]
pub struct ConsoleTelemetry {
    pub pretty_print: bool,
}

impl ConsoleTelemetry {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }
    
    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }
}

impl Default for ConsoleTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryPublisher for ConsoleTelemetry {
    async fn publish_pose(&self, data: &PositionData) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("[POSE] {}", serde_json::to_string_pretty(data)?);
        } else {
            println!("[POSE] {}", serde_json::to_string(data)?);
        }
        Ok(())
    }
    
    async fn publish_state(&self, data: &RobotStateData) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("[STATE] {}", serde_json::to_string_pretty(data)?);
        } else {
            println!("[STATE] {}", serde_json::to_string(data)?);
        }
        Ok(())
    }
    
    async fn publish_command(&self, data: &CommandEventData) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("[COMMAND] {}", serde_json::to_string_pretty(data)?);
        } else {
            println!("[COMMAND] {}", serde_json::to_string(data)?);
        }
        Ok(())
    }
    
    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("[{}] {}", topic, serde_json::to_string_pretty(data)?);
        } else {
            println!("[{}] {}", topic, serde_json::to_string(data)?);
        }
        Ok(())
    }
}