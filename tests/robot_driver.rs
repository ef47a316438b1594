//! Robot Driver integration tests against a fake in-memory transport, per
//! scenario S2 (connect sequence) and invariants 3/4/8.

use async_trait::async_trait;
use dobot_bridge::config::{AxisRange, Envelope, RobotConfig, TransportKind};
use dobot_bridge::error::RobotError;
use dobot_bridge::frame::decode_one;
use dobot_bridge::robot::{MoveMode, Pose, RobotDriver};
use dobot_bridge::transport::Transport;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Replies to a decoded request frame with response params, or `None` to
/// simulate no reply (drives the requester into a timeout/disconnect path).
type Responder = Box<dyn Fn(u8, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

struct FakeTransport {
    responder: Responder,
    sent_ids: Mutex<Vec<u8>>,
    connected: AtomicBool,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl FakeTransport {
    fn new(responder: Responder) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            responder,
            sent_ids: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn sent_ids(&self) -> Vec<u8> {
        self.sent_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), dobot_bridge::error::TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), dobot_bridge::error::TransportError> {
        let (frame, _) = decode_one(bytes).expect("test only sends well-formed frames");
        self.sent_ids.lock().unwrap().push(frame.id);
        if let Some(params) = (self.responder)(frame.id, &frame.params) {
            let response = dobot_bridge::frame::Frame::new(frame.id, frame.ctrl, params);
            let _ = self.tx.send(response.encode()).await;
        }
        Ok(())
    }

    async fn try_recv(&self) -> Option<Vec<u8>> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        self.rx.lock().unwrap().recv().await
    }

    async fn close(&self) -> Result<(), dobot_bridge::error::TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport that errors if `send` is ever invoked, for asserting no wire
/// traffic happens before a local validation rejects a command.
struct NoSendTransport;

#[async_trait]
impl Transport for NoSendTransport {
    async fn connect(&self) -> Result<(), dobot_bridge::error::TransportError> {
        Ok(())
    }
    async fn send(&self, _bytes: &[u8]) -> Result<(), dobot_bridge::error::TransportError> {
        panic!("send() must not be called");
    }
    async fn try_recv(&self) -> Option<Vec<u8>> {
        std::future::pending().await
    }
    async fn close(&self) -> Result<(), dobot_bridge::error::TransportError> {
        Ok(())
    }
}

fn envelope() -> Envelope {
    Envelope {
        x: AxisRange { min: -300.0, max: 300.0 },
        y: AxisRange { min: -300.0, max: 300.0 },
        z: AxisRange { min: -100.0, max: 400.0 },
        r: AxisRange { min: -180.0, max: 180.0 },
    }
}

fn robot_config() -> RobotConfig {
    RobotConfig {
        transport: TransportKind::Tcp,
        serial_path: None,
        baud: None,
        host: Some("127.0.0.1".into()),
        port: Some(29999),
        velocity_ratio: Some(80),
        acceleration_ratio: Some(80),
        home: Pose::new(200.0, 0.0, 50.0, 0.0),
        envelope: envelope(),
    }
}

/// Acks every request immediately with plausible-shaped params: zero alarms,
/// a fixed queue index, and a home-ish pose.
fn acking_responder() -> Responder {
    Box::new(move |id, _params| {
        use dobot_bridge::robot::commands::id::*;
        Some(match id {
            GET_ALARMS_STATE => 0u32.to_le_bytes().to_vec(),
            GET_POSE => {
                let mut p = Vec::new();
                for v in [200.0f32, 0.0, 50.0, 0.0] {
                    p.extend_from_slice(&v.to_le_bytes());
                }
                p
            }
            SET_PTP_CMD | SET_HOME_CMD | QUEUED_CMD_CURRENT_INDEX => 1u32.to_le_bytes().to_vec(),
            _ => vec![],
        })
    })
}

#[tokio::test]
async fn connect_runs_full_init_sequence_in_order() {
    let transport = Arc::new(FakeTransport::new(acking_responder()));
    let driver = Arc::new(RobotDriver::new(transport.clone(), robot_config()));

    driver.connect().await.expect("connect should succeed when every init step acks");
    assert!(driver.is_connected());

    use dobot_bridge::robot::commands::id;
    assert_eq!(
        transport.sent_ids(),
        vec![
            id::CLEAR_ALL_ALARMS,
            id::QUEUED_CMD_CLEAR,
            id::SET_PTP_COMMON_PARAMS,
            id::SET_PTP_COORDINATE_PARAMS,
            id::SET_HOME_CMD,
            id::QUEUED_CMD_START_EXEC,
        ]
    );
}

#[tokio::test]
async fn connect_fails_and_disconnects_when_init_step_never_answers() {
    // CLEAR_ALL_ALARMS never gets a response; the transport looks connected
    // but nothing ever arrives on try_recv, so the request should fail once
    // the caller gives up on the channel (here: the transport is closed
    // mid-flight, which fails all pending requests with ConnectionLost).
    let transport = Arc::new(FakeTransport::new(Box::new(|_id, _p| None)));
    let driver = Arc::new(RobotDriver::new(transport.clone(), robot_config()));

    // Drive a close shortly after connect to unblock the pending request
    // rather than waiting out the real request timeout.
    let closer = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = closer.close().await;
    });

    let err = driver.connect().await.unwrap_err();
    assert!(matches!(err, RobotError::InitializationFailed(_)));
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn move_to_rejects_out_of_envelope_pose_without_any_wire_traffic() {
    let transport = Arc::new(NoSendTransport);
    let driver = Arc::new(RobotDriver::new(transport, robot_config()));

    let out_of_envelope = Pose::new(9000.0, 0.0, 50.0, 0.0);
    let err = driver.move_to(out_of_envelope, MoveMode::LinearXYZ).await.unwrap_err();
    assert!(matches!(err, RobotError::OutOfEnvelope { axis: "x", .. }));
}

#[tokio::test]
async fn move_to_rejects_when_alarms_are_active_and_never_queues_motion() {
    let alarm_bits = Arc::new(AtomicU32::new(0b101));
    let bits = alarm_bits.clone();
    let transport = Arc::new(FakeTransport::new(Box::new(move |id, _params| {
        use dobot_bridge::robot::commands::id::*;
        Some(match id {
            GET_ALARMS_STATE => bits.load(Ordering::SeqCst).to_le_bytes().to_vec(),
            _ => vec![],
        })
    })));
    let driver = Arc::new(RobotDriver::new(transport.clone(), robot_config()));

    let pose = Pose::new(200.0, 0.0, 50.0, 0.0);
    let err = driver.move_to(pose, MoveMode::LinearXYZ).await.unwrap_err();
    assert!(matches!(err, RobotError::AlarmActive(5)));

    use dobot_bridge::robot::commands::id;
    assert!(!transport.sent_ids().contains(&id::SET_PTP_CMD));
}

#[tokio::test]
async fn move_to_succeeds_and_returns_queue_index_when_alarms_clear() {
    let transport = Arc::new(FakeTransport::new(acking_responder()));
    let driver = Arc::new(RobotDriver::new(transport.clone(), robot_config()));

    let pose = Pose::new(200.0, 0.0, 50.0, 0.0);
    let index = driver.move_to(pose, MoveMode::LinearXYZ).await.expect("move should succeed");
    assert_eq!(index, 1);

    use dobot_bridge::robot::commands::id;
    assert!(transport.sent_ids().contains(&id::SET_PTP_CMD));
}

#[tokio::test]
async fn emergency_stop_clears_queue_before_disabling_executor() {
    let transport = Arc::new(FakeTransport::new(acking_responder()));
    let driver = Arc::new(RobotDriver::new(transport.clone(), robot_config()));

    driver.emergency_stop().await.expect("emergency stop should succeed");

    use dobot_bridge::robot::commands::id;
    let ids = transport.sent_ids();
    let clear_pos = ids.iter().position(|&i| i == id::QUEUED_CMD_CLEAR).unwrap();
    let stop_pos = ids.iter().position(|&i| i == id::QUEUED_CMD_STOP_EXEC).unwrap();
    assert!(clear_pos < stop_pos);
}
