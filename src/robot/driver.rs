//! Robot Driver (§4.C): typed request/response over the Frame Codec and
//! Transport, queue management, alarm handling, init sequence.

use super::commands::{id, MoveMode, RobotStatus, WaitOutcome};
use super::pose::Pose;
use crate::config::RobotConfig;
use crate::error::RobotError;
use crate::frame::{Ctrl, Frame, FrameDecoder};
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const REAPER_TICK: Duration = Duration::from_millis(200);
const WAIT_FOR_INDEX_POLL: Duration = Duration::from_millis(50);

struct PendingRequest {
    expected_id: u8,
    epoch: u32,
    deadline: Instant,
    sender: oneshot::Sender<Result<Frame, RobotError>>,
}

/// Pending-request registry, keyed by correlation id. Since the wire
/// protocol does not echo a correlation id, incoming frames are matched
/// FIFO against the oldest pending entry for the same command id — the
/// `order` index below implements that lookup.
#[derive(Default)]
struct Registry {
    entries: HashMap<u32, PendingRequest>,
    order: HashMap<u8, VecDeque<u32>>,
}

impl Registry {
    fn register(
        &mut self,
        corr_id: u32,
        expected_id: u8,
        epoch: u32,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Frame, RobotError>> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            corr_id,
            PendingRequest {
                expected_id,
                epoch,
                deadline: Instant::now() + timeout,
                sender: tx,
            },
        );
        self.order.entry(expected_id).or_default().push_back(corr_id);
        rx
    }

    /// Resolves the oldest pending request matching `frame.id` and `epoch`.
    /// Frames that match no live entry are dropped per §4.C.
    fn resolve(&mut self, frame: Frame, epoch: u32) {
        let Some(queue) = self.order.get_mut(&frame.id) else {
            debug!(id = frame.id, "dropping frame with no matching request");
            return;
        };
        while let Some(corr_id) = queue.pop_front() {
            if let Some(pending) = self.entries.remove(&corr_id) {
                if pending.epoch != epoch {
                    continue;
                }
                let _ = pending.sender.send(Ok(frame));
                return;
            }
        }
        debug!(id = frame.id, "dropping frame with no matching request");
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for corr_id in expired {
            if let Some(pending) = self.entries.remove(&corr_id) {
                if let Some(queue) = self.order.get_mut(&pending.expected_id) {
                    queue.retain(|c| *c != corr_id);
                }
                let _ = pending.sender.send(Err(RobotError::RequestTimeout));
            }
        }
    }

    fn fail_all(&mut self, make_err: impl Fn() -> RobotError) {
        for (_, pending) in self.entries.drain() {
            let _ = pending.sender.send(Err(make_err()));
        }
        self.order.clear();
    }
}

/// Typed request/response driver over a framed robot transport.
pub struct RobotDriver {
    transport: Arc<dyn Transport>,
    registry: Arc<Mutex<Registry>>,
    next_corr_id: AtomicU32,
    epoch: AtomicU32,
    connected: AtomicBool,
    config: RobotConfig,
    tasks_started: AtomicBool,
}

impl RobotDriver {
    pub fn new(transport: Arc<dyn Transport>, config: RobotConfig) -> Self {
        Self {
            transport,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_corr_id: AtomicU32::new(1),
            epoch: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            config,
            tasks_started: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn spawn_tasks_once(self: &Arc<Self>) {
        if self.tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let reader_driver = self.clone();
        tokio::spawn(async move { reader_driver.reader_loop().await });

        let reaper_driver = self.clone();
        tokio::spawn(async move { reaper_driver.reaper_loop().await });
    }

    async fn reader_loop(self: Arc<Self>) {
        let mut decoder = FrameDecoder::new();
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            match self.transport.try_recv().await {
                Some(bytes) => {
                    decoder.push(&bytes);
                    while let Some(result) = decoder.poll_frame() {
                        match result {
                            Ok(frame) => {
                                let mut registry = self.registry.lock().await;
                                registry.resolve(frame, epoch);
                            }
                            Err(e) => {
                                debug!(error = %e, "frame decode error, resynchronizing");
                            }
                        }
                    }
                }
                None => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        warn!("robot transport closed, failing pending requests");
                        let mut registry = self.registry.lock().await;
                        registry.fail_all(|| RobotError::ConnectionLost);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REAPER_TICK);
        loop {
            ticker.tick().await;
            let mut registry = self.registry.lock().await;
            registry.reap_expired();
        }
    }

    async fn request(
        self: &Arc<Self>,
        command_id: u8,
        ctrl: Ctrl,
        params: Vec<u8>,
        timeout: Duration,
    ) -> Result<Frame, RobotError> {
        self.spawn_tasks_once();
        let corr_id = self.next_corr_id.fetch_add(1, Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let rx = {
            let mut registry = self.registry.lock().await;
            registry.register(corr_id, command_id, epoch, timeout)
        };

        let frame = Frame::new(command_id, ctrl, params);
        self.transport
            .send(&frame.encode())
            .await
            .map_err(RobotError::Transport)?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RobotError::Cancelled),
        }
    }

    /// Opens the transport and runs the six-step initialization sequence
    /// (§4.C). Any failure fails `Connect` with `InitializationFailed` and
    /// disconnects the transport.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RobotError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.transport.connect().await.map_err(RobotError::Transport)?;
        self.connected.store(true, Ordering::SeqCst);
        self.spawn_tasks_once();

        if let Err(e) = self.run_init_sequence().await {
            let _ = self.transport.close().await;
            self.connected.store(false, Ordering::SeqCst);
            return Err(RobotError::InitializationFailed(e.to_string()));
        }
        Ok(())
    }

    async fn run_init_sequence(self: &Arc<Self>) -> Result<(), RobotError> {
        // 1. Clear all alarms. REQUIRED — the canonical bug this design
        // guards against is motion silently failing because alarms were
        // never cleared.
        self.request(id::CLEAR_ALL_ALARMS, Ctrl::new(true, false), vec![], DEFAULT_REQUEST_TIMEOUT)
            .await?;

        // 2. Clear the queued-command buffer.
        self.request(id::QUEUED_CMD_CLEAR, Ctrl::new(true, false), vec![], DEFAULT_REQUEST_TIMEOUT)
            .await?;

        // 3. Set PTP common parameters (velocity/acceleration ratios).
        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&(self.config.velocity_ratio() as f32).to_le_bytes());
        params.extend_from_slice(&(self.config.acceleration_ratio() as f32).to_le_bytes());
        self.request(
            id::SET_PTP_COMMON_PARAMS,
            Ctrl::new(true, true),
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;

        // 4. Set PTP coordinate parameters (per-axis velocity/acceleration).
        let ratio = self.config.velocity_ratio() as f32;
        let accel = self.config.acceleration_ratio() as f32;
        let mut params = Vec::with_capacity(16);
        params.extend_from_slice(&ratio.to_le_bytes());
        params.extend_from_slice(&ratio.to_le_bytes());
        params.extend_from_slice(&accel.to_le_bytes());
        params.extend_from_slice(&accel.to_le_bytes());
        self.request(
            id::SET_PTP_COORDINATE_PARAMS,
            Ctrl::new(true, true),
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;

        // 5. Set home parameters.
        let home = self.config.home;
        let mut params = Vec::with_capacity(16);
        params.extend_from_slice(&home.x.to_le_bytes());
        params.extend_from_slice(&home.y.to_le_bytes());
        params.extend_from_slice(&home.z.to_le_bytes());
        params.extend_from_slice(&home.r.to_le_bytes());
        self.request(id::SET_HOME_CMD, Ctrl::new(true, true), params, DEFAULT_REQUEST_TIMEOUT)
            .await?;

        // 6. Start the queued-command executor.
        self.request(
            id::QUEUED_CMD_START_EXEC,
            Ctrl::new(true, false),
            vec![],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;

        Ok(())
    }

    /// Synchronous, non-queued pose read.
    pub async fn get_pose(self: &Arc<Self>) -> Result<Pose, RobotError> {
        let frame = self
            .request(id::GET_POSE, Ctrl::new(false, false), vec![], DEFAULT_REQUEST_TIMEOUT)
            .await?;
        if frame.params.len() < 16 {
            return Err(RobotError::Protocol("GetPose response too short".into()));
        }
        let x = f32::from_le_bytes(frame.params[0..4].try_into().unwrap());
        let y = f32::from_le_bytes(frame.params[4..8].try_into().unwrap());
        let z = f32::from_le_bytes(frame.params[8..12].try_into().unwrap());
        let r = f32::from_le_bytes(frame.params[12..16].try_into().unwrap());
        Ok(Pose::new(x, y, z, r))
    }

    async fn get_alarms(self: &Arc<Self>) -> Result<u32, RobotError> {
        let frame = self
            .request(
                id::GET_ALARMS_STATE,
                Ctrl::new(false, false),
                vec![],
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        let mut bytes = [0u8; 4];
        let n = frame.params.len().min(4);
        bytes[..n].copy_from_slice(&frame.params[..n]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Queued motion. Clears alarms and validates against the envelope
    /// before emitting any wire traffic (§4.C).
    pub async fn move_to(self: &Arc<Self>, pose: Pose, mode: MoveMode) -> Result<u32, RobotError> {
        pose.validate(&self.config.envelope)?;

        self.request(id::CLEAR_ALL_ALARMS, Ctrl::new(true, false), vec![], DEFAULT_REQUEST_TIMEOUT)
            .await?;
        let alarms = self.get_alarms().await?;
        if alarms != 0 {
            return Err(RobotError::AlarmActive(alarms));
        }

        let mut params = Vec::with_capacity(17);
        params.push(mode.ptp_mode_byte());
        params.extend_from_slice(&pose.x.to_le_bytes());
        params.extend_from_slice(&pose.y.to_le_bytes());
        params.extend_from_slice(&pose.z.to_le_bytes());
        params.extend_from_slice(&pose.r.to_le_bytes());

        let frame = self
            .request(id::SET_PTP_CMD, Ctrl::new(true, true), params, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        read_queue_index(&frame)
    }

    /// Queued home command.
    pub async fn home(self: &Arc<Self>) -> Result<u32, RobotError> {
        let home = self.config.home;
        let mut params = Vec::with_capacity(16);
        params.extend_from_slice(&home.x.to_le_bytes());
        params.extend_from_slice(&home.y.to_le_bytes());
        params.extend_from_slice(&home.z.to_le_bytes());
        params.extend_from_slice(&home.r.to_le_bytes());
        let frame = self
            .request(id::SET_HOME_CMD, Ctrl::new(true, true), params, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        read_queue_index(&frame)
    }

    /// Immediate, idempotent end-effector control.
    pub async fn set_suction(self: &Arc<Self>, on: bool) -> Result<(), RobotError> {
        self.request(
            id::SET_END_EFFECTOR_SUCTION_CUP,
            Ctrl::new(true, false),
            vec![1, on as u8],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn set_gripper(self: &Arc<Self>, on: bool) -> Result<(), RobotError> {
        self.request(
            id::SET_END_EFFECTOR_GRIPPER,
            Ctrl::new(true, false),
            vec![1, on as u8],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn set_laser(self: &Arc<Self>, on: bool) -> Result<(), RobotError> {
        self.request(
            id::SET_END_EFFECTOR_LASER,
            Ctrl::new(true, false),
            vec![1, on as u8],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Re-issues the PTP parameter commands with new ratios. Takes effect
    /// immediately; does not require a reconnect.
    pub async fn set_speed(self: &Arc<Self>, velocity_ratio: u8, acceleration_ratio: u8) -> Result<(), RobotError> {
        let velocity_ratio = velocity_ratio.clamp(1, 100) as f32;
        let acceleration_ratio = acceleration_ratio.clamp(1, 100) as f32;

        let mut common = Vec::with_capacity(8);
        common.extend_from_slice(&velocity_ratio.to_le_bytes());
        common.extend_from_slice(&acceleration_ratio.to_le_bytes());
        self.request(id::SET_PTP_COMMON_PARAMS, Ctrl::new(true, true), common, DEFAULT_REQUEST_TIMEOUT)
            .await?;

        let mut coordinate = Vec::with_capacity(16);
        coordinate.extend_from_slice(&velocity_ratio.to_le_bytes());
        coordinate.extend_from_slice(&velocity_ratio.to_le_bytes());
        coordinate.extend_from_slice(&acceleration_ratio.to_le_bytes());
        coordinate.extend_from_slice(&acceleration_ratio.to_le_bytes());
        self.request(
            id::SET_PTP_COORDINATE_PARAMS,
            Ctrl::new(true, true),
            coordinate,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Polls the current-executing index at a fixed cadence until it has
    /// reached `idx` or `deadline` elapses.
    pub async fn wait_for_index(self: &Arc<Self>, idx: u32, deadline: Instant) -> WaitOutcome {
        loop {
            if !self.is_connected() {
                return WaitOutcome::AbortedByDisconnect;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            match self.current_index().await {
                Ok(current) if current >= idx => return WaitOutcome::Reached,
                Ok(_) => {}
                Err(RobotError::ConnectionLost) | Err(RobotError::Transport(_)) => {
                    return WaitOutcome::AbortedByDisconnect
                }
                Err(_) => {}
            }
            tokio::time::sleep(WAIT_FOR_INDEX_POLL).await;
        }
    }

    async fn current_index(self: &Arc<Self>) -> Result<u32, RobotError> {
        let frame = self
            .request(
                id::QUEUED_CMD_CURRENT_INDEX,
                Ctrl::new(false, false),
                vec![],
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        read_queue_index(&frame)
    }

    /// Immediate; abandons all outstanding queued work.
    pub async fn clear_queue(self: &Arc<Self>) -> Result<(), RobotError> {
        self.request(
            id::QUEUED_CMD_CLEAR,
            Ctrl::new(true, false),
            vec![],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Immediate, idempotent: clears the queue then disables the executor.
    pub async fn emergency_stop(self: &Arc<Self>) -> Result<(), RobotError> {
        self.clear_queue().await?;
        self.request(
            id::QUEUED_CMD_STOP_EXEC,
            Ctrl::new(true, false),
            vec![],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn get_status(self: &Arc<Self>) -> Result<RobotStatus, RobotError> {
        let current_index = self.current_index().await?;
        let alarms = self.get_alarms().await?;
        Ok(RobotStatus {
            current_index,
            idle: alarms == 0,
            alarms,
        })
    }
}

fn read_queue_index(frame: &Frame) -> Result<u32, RobotError> {
    if frame.params.len() < 4 {
        return Err(RobotError::Protocol(
            "expected a 4-byte queue index in response".into(),
        ));
    }
    Ok(u32::from_le_bytes(frame.params[0..4].try_into().unwrap()))
}
