//! PLC Driver Facade (§4.D): typed S7Comm accessors with connection
//! supervision, built on the `s7` crate rather than a hand-rolled
//! ISO-on-TCP/COTP/S7 negotiation.

use crate::config::PlcConfig;
use crate::error::PlcError;
use byteorder::{BigEndian, ByteOrder};
use s7::{client, tcp, transport::Connection};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration as StdDuration, Instant as StdInstant};
use tokio::time::{timeout, Duration};
use tracing::warn;

type Client = client::PG<tcp::Transport>;

/// Named control bits on the single marker byte M0.x (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlBits {
    pub start: bool,
    pub stop: bool,
    pub home: bool,
    pub estop: bool,
    pub suction: bool,
    pub ready: bool,
    pub busy: bool,
    pub error: bool,
}

impl ControlBits {
    fn from_byte(b: u8) -> Self {
        Self {
            start: b & 0x01 != 0,
            stop: b & 0x02 != 0,
            home: b & 0x04 != 0,
            estop: b & 0x08 != 0,
            suction: b & 0x10 != 0,
            ready: b & 0x20 != 0,
            busy: b & 0x40 != 0,
            error: b & 0x80 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        (self.start as u8)
            | ((self.stop as u8) << 1)
            | ((self.home as u8) << 2)
            | ((self.estop as u8) << 3)
            | ((self.suction as u8) << 4)
            | ((self.ready as u8) << 5)
            | ((self.busy as u8) << 6)
            | ((self.error as u8) << 7)
    }
}

/// Sparse patch applied to the control byte: only present keys are written.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlBitsPatch {
    pub start: Option<bool>,
    pub stop: Option<bool>,
    pub home: Option<bool>,
    pub estop: Option<bool>,
    pub suction: Option<bool>,
    pub ready: Option<bool>,
    pub busy: Option<bool>,
    pub error: Option<bool>,
}

impl ControlBitsPatch {
    fn apply(self, current: ControlBits) -> ControlBits {
        ControlBits {
            start: self.start.unwrap_or(current.start),
            stop: self.stop.unwrap_or(current.stop),
            home: self.home.unwrap_or(current.home),
            estop: self.estop.unwrap_or(current.estop),
            suction: self.suction.unwrap_or(current.suction),
            ready: self.ready.unwrap_or(current.ready),
            busy: self.busy.unwrap_or(current.busy),
            error: self.error.unwrap_or(current.error),
        }
    }
}

/// Three consecutive big-endian REALs: x, y, z. The PLC memory map (§6) has
/// no rotation field, unlike the robot's four-field `Pose`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// `StatusCode` written at DB1:24 (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Idle = 0,
    Executing = 1,
    Error = 2,
    Homing = 3,
    Stopped = 4,
    EmergencyStop = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Connected,
    Disconnected,
}

/// Control byte and target/feedback DB offsets (§6, authoritative).
const CONTROL_BYTE: i32 = 0;
const TARGET_DB: i32 = 1;
const TARGET_OFFSET: i32 = 0;
const FEEDBACK_OFFSET: i32 = 12;
const STATUS_OFFSET: i32 = 24;

struct Session {
    client: Client,
}

/// Typed accessors over S7Comm with auto-reconnect (§4.D).
pub struct PlcDriver {
    config: PlcConfig,
    session: Arc<StdMutex<Option<Session>>>,
    connected: AtomicBool,
    last_attempt: StdMutex<Option<StdInstant>>,
}

impl PlcDriver {
    pub fn new(config: PlcConfig) -> Self {
        Self {
            config,
            session: Arc::new(StdMutex::new(None)),
            connected: AtomicBool::new(false),
            last_attempt: StdMutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Bounded retry: 3 attempts, 1 s spacing by default.
    pub async fn connect(&self) -> Result<(), PlcError> {
        let addr = IpAddr::from_str(&self.config.ip)
            .map_err(|e| PlcError::S7(format!("invalid PLC ip {}: {}", self.config.ip, e)))?;
        let rack = self.config.rack();
        let slot = self.config.slot();

        *self.last_attempt.lock().unwrap() = Some(StdInstant::now());

        let mut last_err = None;
        for attempt in 0..3 {
            let result = tokio::task::spawn_blocking(move || {
                let options = tcp::Options::new(addr, rack, slot, Connection::PG);
                tcp::Transport::connect(options).and_then(client::PG::new)
            })
            .await
            .map_err(|_| PlcError::Cancelled)?;

            match result {
                Ok(client) => {
                    *self.session.lock().unwrap() = Some(Session { client });
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "PLC connect attempt failed");
                    last_err = Some(e);
                    if attempt < 2 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(PlcError::S7(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            *self.session.lock().unwrap() = None;
        }
    }

    async fn with_session<T, F>(&self, read_timeout: Duration, f: F) -> Result<T, PlcError>
    where
        F: FnOnce(&mut Client) -> Result<T, s7::error::Error> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_connected() {
            return Err(PlcError::NotConnected);
        }
        let session = self.session.clone();
        let call = tokio::task::spawn_blocking(move || {
            let mut guard = session.lock().unwrap();
            let session = guard.as_mut().ok_or(s7::error::Error::Connect)?;
            f(&mut session.client)
        });

        match timeout(read_timeout, call).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                self.mark_disconnected();
                Err(PlcError::S7(e.to_string()))
            }
            Ok(Err(_)) => {
                self.mark_disconnected();
                Err(PlcError::Cancelled)
            }
            Err(_) => {
                self.mark_disconnected();
                Err(PlcError::ReadTimeout)
            }
        }
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms())
    }

    pub async fn read_db(&self, db: i32, offset: i32, size: i32) -> Result<Vec<u8>, PlcError> {
        let timeout = self.read_timeout();
        self.with_session(timeout, move |client| {
            let mut buf = vec![0u8; size as usize];
            client.db_read(db, offset, size, &mut buf)?;
            Ok(buf)
        })
        .await
    }

    pub async fn write_db(&self, db: i32, offset: i32, bytes: Vec<u8>) -> Result<(), PlcError> {
        let timeout = self.read_timeout();
        self.with_session(timeout, move |client| {
            let mut bytes = bytes;
            client.db_write(db, offset, bytes.len() as i32, &mut bytes)
        })
        .await
    }

    /// Read-modify-write on the marker byte; serialized by holding the
    /// session lock across the whole operation, so concurrent bit writes to
    /// the same byte never lose an update (invariant 9).
    pub async fn write_marker_bit(&self, byte: i32, bit: u8, value: bool) -> Result<(), PlcError> {
        let timeout = self.read_timeout();
        self.with_session(timeout, move |client| {
            let mut buf = vec![0u8; 1];
            client.mb_read(byte, 1, &mut buf)?;
            let mut b = buf[0];
            if value {
                b |= 1 << bit;
            } else {
                b &= !(1 << bit);
            }
            let mut out = vec![b];
            client.mb_write(byte, 1, &mut out)
        })
        .await
    }

    pub async fn read_marker_bit(&self, byte: i32, bit: u8) -> Result<bool, PlcError> {
        let b = self.read_marker_byte(byte).await?;
        Ok(b & (1 << bit) != 0)
    }

    async fn read_marker_byte(&self, byte: i32) -> Result<u8, PlcError> {
        let timeout = self.read_timeout();
        self.with_session(timeout, move |client| {
            let mut buf = vec![0u8; 1];
            client.mb_read(byte, 1, &mut buf)?;
            Ok(buf[0])
        })
        .await
    }

    pub async fn read_real(&self, db: i32, offset: i32) -> Result<f32, PlcError> {
        let bytes = self.read_db(db, offset, 4).await?;
        Ok(BigEndian::read_f32(&bytes))
    }

    pub async fn write_real(&self, db: i32, offset: i32, value: f32) -> Result<(), PlcError> {
        let mut bytes = [0u8; 4];
        BigEndian::write_f32(&mut bytes, value);
        self.write_db(db, offset, bytes.to_vec()).await
    }

    pub async fn read_int16(&self, db: i32, offset: i32) -> Result<i16, PlcError> {
        let bytes = self.read_db(db, offset, 2).await?;
        Ok(BigEndian::read_i16(&bytes))
    }

    pub async fn write_int16(&self, db: i32, offset: i32, value: i16) -> Result<(), PlcError> {
        let mut bytes = [0u8; 2];
        BigEndian::write_i16(&mut bytes, value);
        self.write_db(db, offset, bytes.to_vec()).await
    }

    pub async fn read_word(&self, db: i32, offset: i32) -> Result<u16, PlcError> {
        let bytes = self.read_db(db, offset, 2).await?;
        Ok(BigEndian::read_u16(&bytes))
    }

    pub async fn write_word(&self, db: i32, offset: i32, value: u16) -> Result<(), PlcError> {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.write_db(db, offset, bytes.to_vec()).await
    }

    pub async fn read_dword(&self, db: i32, offset: i32) -> Result<u32, PlcError> {
        let bytes = self.read_db(db, offset, 4).await?;
        Ok(BigEndian::read_u32(&bytes))
    }

    pub async fn write_dword(&self, db: i32, offset: i32, value: u32) -> Result<(), PlcError> {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, value);
        self.write_db(db, offset, bytes.to_vec()).await
    }

    /// Reads the target position written by the PLC program (DB1:0..8).
    pub async fn read_target_position(&self) -> Result<Position, PlcError> {
        let bytes = self.read_db(TARGET_DB, TARGET_OFFSET, 12).await?;
        Ok(Position {
            x: BigEndian::read_f32(&bytes[0..4]),
            y: BigEndian::read_f32(&bytes[4..8]),
            z: BigEndian::read_f32(&bytes[8..12]),
        })
    }

    /// Writes the feedback position (DB1:12..20).
    pub async fn write_feedback_position(&self, pos: Position) -> Result<(), PlcError> {
        let mut bytes = [0u8; 12];
        BigEndian::write_f32(&mut bytes[0..4], pos.x);
        BigEndian::write_f32(&mut bytes[4..8], pos.y);
        BigEndian::write_f32(&mut bytes[8..12], pos.z);
        self.write_db(TARGET_DB, FEEDBACK_OFFSET, bytes.to_vec()).await
    }

    pub async fn read_control_bits(&self) -> Result<ControlBits, PlcError> {
        let b = self.read_marker_byte(CONTROL_BYTE).await?;
        Ok(ControlBits::from_byte(b))
    }

    /// Sparse patch: only present keys are written.
    pub async fn write_control_bits(&self, patch: ControlBitsPatch) -> Result<(), PlcError> {
        let timeout = self.read_timeout();
        self.with_session(timeout, move |client| {
            let mut buf = vec![0u8; 1];
            client.mb_read(CONTROL_BYTE, 1, &mut buf)?;
            let current = ControlBits::from_byte(buf[0]);
            let next = patch.apply(current);
            let mut out = vec![next.to_byte()];
            client.mb_write(CONTROL_BYTE, 1, &mut out)
        })
        .await
    }

    pub async fn write_status(&self, status: StatusCode) -> Result<(), PlcError> {
        self.write_int16(TARGET_DB, STATUS_OFFSET, status as i16).await
    }

    /// Probes a known marker byte and a small DB read.
    pub async fn health_check(&self) -> HealthState {
        if !self.is_connected() {
            return HealthState::Disconnected;
        }
        match self.read_marker_byte(CONTROL_BYTE).await {
            Ok(_) => HealthState::Connected,
            Err(_) => HealthState::Disconnected,
        }
    }

    /// Watchdog step: reconnects if not connected and the cooldown since the
    /// last attempt has elapsed. Intended to be driven by a
    /// `tokio::time::interval` task at `plc.watchdogMs`.
    pub async fn watchdog_tick(&self) {
        if self.is_connected() {
            return;
        }
        let cooldown = StdDuration::from_millis(self.config.reconnect_cooldown_ms());
        let ready = {
            let last = self.last_attempt.lock().unwrap();
            match *last {
                Some(t) => t.elapsed() >= cooldown,
                None => true,
            }
        };
        if ready {
            if let Err(e) = self.connect().await {
                warn!(error = %e, "PLC watchdog reconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bits_round_trip_through_byte() {
        let bits = ControlBits {
            start: true,
            stop: false,
            home: true,
            estop: false,
            suction: true,
            ready: false,
            busy: true,
            error: false,
        };
        let back = ControlBits::from_byte(bits.to_byte());
        assert_eq!(back.start, bits.start);
        assert_eq!(back.stop, bits.stop);
        assert_eq!(back.home, bits.home);
        assert_eq!(back.estop, bits.estop);
        assert_eq!(back.suction, bits.suction);
        assert_eq!(back.ready, bits.ready);
        assert_eq!(back.busy, bits.busy);
        assert_eq!(back.error, bits.error);
    }

    #[test]
    fn control_bits_patch_only_touches_present_keys() {
        let current = ControlBits {
            start: true,
            stop: true,
            home: false,
            estop: false,
            suction: true,
            ready: true,
            busy: false,
            error: false,
        };
        let patch = ControlBitsPatch {
            start: Some(false),
            ..Default::default()
        };
        let next = patch.apply(current);
        assert!(!next.start);
        assert!(next.stop);
        assert!(next.suction);
        assert!(next.ready);
    }

    #[test]
    fn estop_bit_survives_round_trip_at_its_own_position() {
        let b = ControlBits {
            estop: true,
            ..Default::default()
        }
        .to_byte();
        assert_eq!(b, 0x08);
        assert!(ControlBits::from_byte(b).estop);
    }

    #[test]
    fn status_code_serializes_as_snake_case() {
        let json = serde_json::to_string(&StatusCode::EmergencyStop).unwrap();
        assert_eq!(json, "\"emergency_stop\"");
    }
}
