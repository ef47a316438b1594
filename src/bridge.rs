//! Bridge Coordinator (§4.F): the cooperative polling loop translating PLC
//! intent into robot motion and mirroring robot feedback back into PLC
//! memory.

use crate::adapter::AdapterEvent;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::plc::{ControlBits, ControlBitsPatch, HealthState, PlcDriver, Position, StatusCode};
use crate::robot::{MoveMode, Pose, RobotDriver};
use crate::safety::SafetySupervisor;
use crate::telemetry::{PositionData, RobotStateData, TelemetryPublisher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Bridge-level state machine (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Running,
    Halted,
}

/// Point-in-time snapshot published on every tick for pull queries (§4.G).
#[derive(Debug, Clone)]
pub struct BridgeSnapshot {
    pub bridge_state: BridgeState,
    pub status: StatusCode,
    pub pose: Option<Pose>,
    pub pose_stale: bool,
    pub robot_connected: bool,
    pub plc_connected: bool,
    pub emergency_active: bool,
}

impl Default for BridgeSnapshot {
    fn default() -> Self {
        Self {
            bridge_state: BridgeState::Stopped,
            status: StatusCode::Idle,
            pose: None,
            pose_stale: true,
            robot_connected: false,
            plc_connected: false,
            emergency_active: false,
        }
    }
}

enum BridgeCommand {
    Start,
    Stop,
}

/// Handle shared with the External Adapter: issues Start/Stop, subscribes
/// to events, and reads the latest snapshot.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<BridgeCommand>,
    snapshot: watch::Receiver<BridgeSnapshot>,
    events: broadcast::Sender<AdapterEvent>,
}

impl BridgeHandle {
    pub async fn request_start(&self) {
        let _ = self.commands.send(BridgeCommand::Start).await;
    }

    pub async fn request_stop(&self) {
        let _ = self.commands.send(BridgeCommand::Stop).await;
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

struct TickState {
    busy: bool,
    prev_bits: ControlBits,
    emergency_latch: bool,
    consecutive_errors: u32,
    last_submitted_index: Option<u32>,
    last_feedback_pose: Option<Position>,
    last_feedback_emit: Option<Instant>,
}

impl Default for TickState {
    fn default() -> Self {
        Self {
            busy: false,
            prev_bits: ControlBits::default(),
            emergency_latch: false,
            consecutive_errors: 0,
            last_submitted_index: None,
            last_feedback_pose: None,
            last_feedback_emit: None,
        }
    }
}

pub struct Bridge {
    robot: Arc<RobotDriver>,
    plc: Arc<PlcDriver>,
    safety: SafetySupervisor,
    config: BridgeConfig,
    snapshot_tx: watch::Sender<BridgeSnapshot>,
    events_tx: broadcast::Sender<AdapterEvent>,
    commands_rx: Mutex<mpsc::Receiver<BridgeCommand>>,
    telemetry: Arc<dyn TelemetryPublisher>,
}

impl Bridge {
    pub fn new(
        robot: Arc<RobotDriver>,
        plc: Arc<PlcDriver>,
        safety: SafetySupervisor,
        config: BridgeConfig,
        telemetry: Arc<dyn TelemetryPublisher>,
    ) -> (Self, BridgeHandle) {
        let (snapshot_tx, snapshot_rx) = watch::channel(BridgeSnapshot::default());
        let (events_tx, _) = broadcast::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(8);

        let handle = BridgeHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            events: events_tx.clone(),
        };
        let bridge = Self {
            robot,
            plc,
            safety,
            config,
            snapshot_tx,
            events_tx,
            commands_rx: Mutex::new(commands_rx),
            telemetry,
        };
        (bridge, handle)
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish(&self, snapshot: BridgeSnapshot) {
        self.emit(AdapterEvent::BridgeStateChanged(snapshot.bridge_state));
        let _ = self.snapshot_tx.send(snapshot);
    }

    async fn report_telemetry(&self, pose: Pose) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let snapshot = self.snapshot_tx.borrow().clone();
        if let Err(e) = self
            .telemetry
            .publish_pose(&PositionData {
                pose,
                timestamp,
                robot_connected: snapshot.robot_connected,
                emergency_stopped: snapshot.emergency_active,
            })
            .await
        {
            warn!(error = %e, "telemetry publish_pose failed");
        }
        if let Err(e) = self
            .telemetry
            .publish_state(&RobotStateData {
                status: snapshot.status,
                bridge_state: format!("{:?}", snapshot.bridge_state),
                timestamp,
                robot_connected: snapshot.robot_connected,
                plc_connected: snapshot.plc_connected,
            })
            .await
        {
            warn!(error = %e, "telemetry publish_state failed");
        }
    }

    /// Drives the poll loop until the process shuts down. Runs as an
    /// independent task (§5); ticks are non-overlapping because the loop is
    /// strictly sequential and missed ticks are skipped, never queued.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms()));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tick_state = TickState::default();
        let mut bridge_state = BridgeState::Stopped;

        loop {
            ticker.tick().await;
            self.drain_commands(&mut bridge_state).await;
            if bridge_state != BridgeState::Running {
                continue;
            }
            match self.run_tick(&mut tick_state).await {
                Ok(()) => {
                    tick_state.consecutive_errors = 0;
                }
                Err(e) => {
                    tick_state.consecutive_errors += 1;
                    error!(error = %e, consecutive = tick_state.consecutive_errors, "bridge tick failed");
                    if tick_state.consecutive_errors >= self.config.error_threshold() {
                        bridge_state = BridgeState::Halted;
                        warn!("bridge halted after reaching error threshold");
                        self.publish(BridgeSnapshot {
                            bridge_state,
                            status: StatusCode::Error,
                            pose: tick_state.last_feedback_pose.map(position_to_pose),
                            pose_stale: true,
                            robot_connected: self.robot.is_connected(),
                            plc_connected: self.plc.is_connected(),
                            emergency_active: tick_state.emergency_latch,
                        });
                    } else {
                        tokio::time::sleep(backoff(tick_state.consecutive_errors)).await;
                    }
                }
            }
        }
    }

    async fn drain_commands(&self, bridge_state: &mut BridgeState) {
        let mut rx = self.commands_rx.lock().await;
        while let Ok(cmd) = rx.try_recv() {
            Self::apply_command(cmd, bridge_state);
        }
    }

    fn apply_command(cmd: BridgeCommand, bridge_state: &mut BridgeState) {
        match (cmd, *bridge_state) {
            (BridgeCommand::Start, BridgeState::Stopped) | (BridgeCommand::Start, BridgeState::Halted) => {
                info!(from = ?*bridge_state, "bridge starting");
                *bridge_state = BridgeState::Running;
            }
            (BridgeCommand::Stop, _) => {
                info!("bridge stopping");
                *bridge_state = BridgeState::Stopped;
            }
            _ => {}
        }
    }

    async fn run_tick(&self, state: &mut TickState) -> Result<(), BridgeError> {
        // 1. Read ControlBits and TargetPose.
        let control_bits = self.plc.read_control_bits().await?;
        let target = self.plc.read_target_position().await?;

        // 2. Emergency handling.
        if control_bits.estop && !state.prev_bits.estop {
            self.safety.emergency(&self.robot, &self.plc).await;
            state.emergency_latch = true;
            state.busy = false;
            self.emit(AdapterEvent::EmergencyStop);
            state.prev_bits = control_bits;
            self.publish(BridgeSnapshot {
                bridge_state: BridgeState::Running,
                status: StatusCode::EmergencyStop,
                pose: state.last_feedback_pose.map(position_to_pose),
                pose_stale: true,
                robot_connected: self.robot.is_connected(),
                plc_connected: self.plc.is_connected(),
                emergency_active: true,
            });
            return Ok(());
        }
        if !control_bits.estop && state.prev_bits.estop {
            state.emergency_latch = false;
        }

        // 3. Edge-triggered command dispatch, tie-break stop > home > start.
        let stop_edge = control_bits.stop && !state.prev_bits.stop;
        let home_edge = control_bits.home && !state.prev_bits.home;
        let start_edge = control_bits.start && !state.prev_bits.start;

        if !state.busy && !state.emergency_latch {
            if stop_edge {
                self.robot.clear_queue().await?;
                self.plc.write_status(StatusCode::Stopped).await?;
                self.plc
                    .write_control_bits(ControlBitsPatch {
                        stop: Some(false),
                        ..Default::default()
                    })
                    .await?;
                state.busy = false;
                self.emit(AdapterEvent::StatusChanged(StatusCode::Stopped));
            } else if home_edge {
                self.robot.home().await?;
                self.plc.write_status(StatusCode::Homing).await?;
                self.plc
                    .write_control_bits(ControlBitsPatch {
                        home: Some(false),
                        ..Default::default()
                    })
                    .await?;
                self.emit(AdapterEvent::StatusChanged(StatusCode::Homing));
            } else if start_edge {
                let pose = position_to_pose(target);
                self.safety.validate(&pose)?;
                let index = self
                    .robot
                    .move_to(pose, MoveMode::LinearXYZ)
                    .await
                    ?;
                self.plc.write_status(StatusCode::Executing).await?;
                self.plc
                    .write_control_bits(ControlBitsPatch {
                        start: Some(false),
                        ..Default::default()
                    })
                    .await?;
                state.busy = true;
                state.last_submitted_index = Some(index);
                self.emit(AdapterEvent::StatusChanged(StatusCode::Executing));
            }
        }

        // 4. Progress check.
        if state.busy {
            if let Some(last_index) = state.last_submitted_index {
                let status = self.robot.get_status().await?;
                if status.current_index >= last_index {
                    state.busy = false;
                    self.plc.write_status(StatusCode::Idle).await?;
                    self.emit(AdapterEvent::StatusChanged(StatusCode::Idle));
                }
            }
        }

        // 5. Feedback, capped at `bridge.feedbackMaxHz`.
        let pose = self.robot.get_pose().await?;
        let position = Position {
            x: pose.x,
            y: pose.y,
            z: pose.z,
        };
        let changed = match state.last_feedback_pose {
            Some(last) => max_abs_diff(last, position) > self.config.pose_epsilon_mm(),
            None => true,
        };
        if changed {
            self.plc.write_feedback_position(position).await?;
            state.last_feedback_pose = Some(position);
        }

        let min_interval = Duration::from_secs_f64(1.0 / self.config.feedback_max_hz().max(1) as f64);
        let should_emit = match state.last_feedback_emit {
            Some(last) => last.elapsed() >= min_interval,
            None => true,
        };
        if should_emit {
            self.emit(AdapterEvent::PoseUpdated(pose));
            state.last_feedback_emit = Some(Instant::now());
            self.report_telemetry(pose).await;
        }

        // 6. Save edge-detection state.
        state.prev_bits = control_bits;

        let plc_health = self.plc.health_check().await;
        self.publish(BridgeSnapshot {
            bridge_state: BridgeState::Running,
            status: StatusCode::Idle,
            pose: Some(pose),
            pose_stale: false,
            robot_connected: self.robot.is_connected(),
            plc_connected: plc_health == HealthState::Connected,
            emergency_active: state.emergency_latch,
        });

        Ok(())
    }
}

fn position_to_pose(position: Position) -> Pose {
    Pose::new(position.x, position.y, position.z, 0.0)
}

fn max_abs_diff(a: Position, b: Position) -> f32 {
    (a.x - b.x).abs().max((a.y - b.y).abs()).max((a.z - b.z).abs())
}

fn backoff(consecutive_errors: u32) -> Duration {
    Duration::from_millis(100 * consecutive_errors.min(10) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_to_pose_defaults_rotation_to_zero() {
        let pose = position_to_pose(Position { x: 1.0, y: 2.0, z: 3.0 });
        assert_eq!(pose, Pose::new(1.0, 2.0, 3.0, 0.0));
    }

    #[test]
    fn max_abs_diff_picks_the_largest_axis_delta() {
        let a = Position { x: 0.0, y: 0.0, z: 0.0 };
        let b = Position { x: 1.0, y: -5.0, z: 2.0 };
        assert_eq!(max_abs_diff(a, b), 5.0);
    }

    #[test]
    fn backoff_grows_linearly_and_caps_at_ten_errors() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(3), Duration::from_millis(300));
        assert_eq!(backoff(50), backoff(10));
    }

    #[test]
    fn apply_command_start_resumes_from_stopped_and_halted_but_not_running() {
        let mut state = BridgeState::Stopped;
        Bridge::apply_command(BridgeCommand::Start, &mut state);
        assert_eq!(state, BridgeState::Running);

        let mut state = BridgeState::Halted;
        Bridge::apply_command(BridgeCommand::Start, &mut state);
        assert_eq!(state, BridgeState::Running);
    }

    #[test]
    fn apply_command_stop_always_wins() {
        for mut state in [BridgeState::Stopped, BridgeState::Running, BridgeState::Halted] {
            Bridge::apply_command(BridgeCommand::Stop, &mut state);
            assert_eq!(state, BridgeState::Stopped);
        }
    }
}
