//! External Adapter (§4.G): the outward translation layer to the API/UI
//! layer. Owns no state of its own; every command routes through the
//! Safety Supervisor, every observable and query is read off the Bridge's
//! handle.

use crate::bridge::{BridgeHandle, BridgeSnapshot, BridgeState};
use crate::config::Config;
use crate::error::{AdapterError, BridgeCoordinatorError, BridgeError};
use crate::plc::StatusCode;
use crate::robot::{Pose, RobotDriver};
use crate::safety::SafetySupervisor;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One variant per observable named in §4.G.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    PoseUpdated(Pose),
    StatusChanged(StatusCode),
    BridgeStateChanged(BridgeState),
    RobotConnected,
    RobotDisconnected,
    PlcConnected,
    PlcDisconnected,
    EmergencyStop,
}

/// Configuration snapshot exposed to pull queries; intentionally a reduced
/// view, not the raw `Config` (no filesystem path, no secrets-adjacent
/// fields to leak outward).
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub poll_interval_ms: u64,
    pub error_threshold: u32,
    pub pose_epsilon_mm: f32,
    pub feedback_max_hz: u32,
}

impl From<&Config> for ConfigSnapshot {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval_ms: config.bridge.poll_interval_ms(),
            error_threshold: config.bridge.error_threshold(),
            pose_epsilon_mm: config.bridge.pose_epsilon_mm(),
            feedback_max_hz: config.bridge.feedback_max_hz(),
        }
    }
}

pub struct ExternalAdapter {
    bridge: BridgeHandle,
    robot: Arc<RobotDriver>,
    safety: Arc<SafetySupervisor>,
    config_snapshot: ConfigSnapshot,
}

impl ExternalAdapter {
    pub fn new(
        bridge: BridgeHandle,
        robot: Arc<RobotDriver>,
        safety: Arc<SafetySupervisor>,
        config: &Config,
    ) -> Self {
        Self {
            bridge,
            robot,
            safety,
            config_snapshot: ConfigSnapshot::from(config),
        }
    }

    fn reject_if_unavailable(&self) -> Result<(), AdapterError> {
        let snapshot = self.bridge.snapshot();
        if snapshot.bridge_state == BridgeState::Halted {
            return Err(AdapterError::from(&BridgeError::Coordinator(
                BridgeCoordinatorError::BridgeHalted,
            )));
        }
        if snapshot.emergency_active {
            return Err(AdapterError::from(&BridgeError::Coordinator(
                BridgeCoordinatorError::EmergencyActive,
            )));
        }
        Ok(())
    }

    pub async fn move_to(&self, pose: Pose) -> Result<u32, AdapterError> {
        self.reject_if_unavailable()?;
        self.safety
            .validate(&pose)
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))?;
        self.robot
            .move_to(pose, crate::robot::MoveMode::LinearXYZ)
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub async fn home(&self) -> Result<u32, AdapterError> {
        self.reject_if_unavailable()?;
        self.robot
            .home()
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub async fn stop(&self) -> Result<(), AdapterError> {
        self.robot
            .clear_queue()
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub async fn set_suction(&self, on: bool) -> Result<(), AdapterError> {
        self.reject_if_unavailable()?;
        self.robot
            .set_suction(on)
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub async fn set_gripper(&self, on: bool) -> Result<(), AdapterError> {
        self.reject_if_unavailable()?;
        self.robot
            .set_gripper(on)
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub async fn emergency_stop(&self) -> Result<(), AdapterError> {
        self.robot
            .emergency_stop()
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub async fn set_speed(&self, velocity_ratio: u8, acceleration_ratio: u8) -> Result<(), AdapterError> {
        self.reject_if_unavailable()?;
        self.robot
            .set_speed(velocity_ratio, acceleration_ratio)
            .await
            .map_err(|e| AdapterError::from(&BridgeError::Robot(e)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.bridge.subscribe()
    }

    pub fn latest_pose(&self) -> (Option<Pose>, bool) {
        let snapshot = self.bridge.snapshot();
        (snapshot.pose, snapshot.pose_stale)
    }

    pub fn latest_status(&self) -> StatusCode {
        self.bridge.snapshot().status
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.bridge.snapshot().bridge_state
    }

    pub fn connection_states(&self) -> (bool, bool) {
        let snapshot = self.bridge.snapshot();
        (snapshot.robot_connected, snapshot.plc_connected)
    }

    pub fn config_snapshot(&self) -> ConfigSnapshot {
        self.config_snapshot.clone()
    }

    pub fn full_snapshot(&self) -> BridgeSnapshot {
        self.bridge.snapshot()
    }

    pub async fn start_bridge(&self) {
        self.bridge.request_start().await;
    }

    pub async fn stop_bridge(&self) {
        self.bridge.request_stop().await;
    }
}
