//! Error types for the bridge

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Frame codec errors (§4.A). Resolved locally by the decoder; never surfaced
/// past the Robot Driver's read loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("magic bytes did not match")]
    MagicMismatch,
    #[error("declared length {0} is inconsistent with buffered data")]
    BadLength(u8),
    #[error("checksum mismatch: expected {expected:#04x}, got {got:#04x}")]
    BadChecksum { expected: u8, got: u8 },
    #[error("buffer does not yet contain a full frame")]
    Truncated,
}

/// Transport failures, unified across serial and TCP variants (§4.B).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("transport was closed")]
    Closed,
}

/// Robot Driver errors (§4.C).
#[derive(Error, Debug)]
pub enum RobotError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected command id in response: expected {expected}, got {got}")]
    UnexpectedCommandId { expected: u8, got: u8 },
    #[error("request timed out")]
    RequestTimeout,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("robot initialization failed: {0}")]
    InitializationFailed(String),
    #[error("pose is outside the configured envelope")]
    OutOfEnvelope {
        axis: &'static str,
        value: f32,
        bound: f32,
    },
    #[error("alarm bitfield is non-zero: {0:#010b}")]
    AlarmActive(u32),
    #[error("operation invalid in current state: {0}")]
    InvalidStateForOperation(String),
    #[error("connection was lost")]
    ConnectionLost,
    #[error("operation was cancelled")]
    Cancelled,
}

/// PLC Driver errors (§4.D).
#[derive(Error, Debug)]
pub enum PlcError {
    #[error("not connected to PLC")]
    NotConnected,
    #[error("S7Comm error: {0}")]
    S7(String),
    #[error("read timed out")]
    ReadTimeout,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("operation was cancelled")]
    Cancelled,
}

/// Coordinator-level errors (§4.F, §4.G).
#[derive(Error, Debug)]
pub enum BridgeCoordinatorError {
    #[error("bridge is halted")]
    BridgeHalted,
    #[error("emergency stop is active")]
    EmergencyActive,
    #[error("a required driver is unavailable")]
    DriverUnavailable,
    #[error(transparent)]
    Robot(#[from] RobotError),
    #[error(transparent)]
    Plc(#[from] PlcError),
}

/// Top-level error enum a caller outside this crate actually matches on.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Robot(#[from] RobotError),
    #[error(transparent)]
    Plc(#[from] PlcError),
    #[error(transparent)]
    Coordinator(#[from] BridgeCoordinatorError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Error kind, stable and versioned, exposed to the External Adapter's
/// callers. Internal details (wire bytes, stack traces) are logged, not
/// carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Timeout,
    Semantic,
    Coordinator,
}

/// Stable error shape surfaced to external callers (§7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Option<String>,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<&BridgeError> for AdapterError {
    fn from(err: &BridgeError) -> Self {
        let kind = match err {
            BridgeError::Frame(_) | BridgeError::Transport(_) => ErrorKind::Transport,
            BridgeError::Robot(RobotError::Protocol(_))
            | BridgeError::Robot(RobotError::UnexpectedCommandId { .. }) => ErrorKind::Protocol,
            BridgeError::Robot(RobotError::RequestTimeout)
            | BridgeError::Robot(RobotError::ConnectTimeout)
            | BridgeError::Plc(PlcError::ReadTimeout)
            | BridgeError::Plc(PlcError::ConnectTimeout) => ErrorKind::Timeout,
            BridgeError::Robot(RobotError::OutOfEnvelope { .. })
            | BridgeError::Robot(RobotError::AlarmActive(_))
            | BridgeError::Robot(RobotError::InvalidStateForOperation(_)) => ErrorKind::Semantic,
            BridgeError::Robot(_) | BridgeError::Plc(_) => ErrorKind::Transport,
            BridgeError::Coordinator(_) => ErrorKind::Coordinator,
            BridgeError::Config(_) | BridgeError::Yaml(_) | BridgeError::Task(_) => {
                ErrorKind::Coordinator
            }
        };
        AdapterError::new(kind, err.to_string())
    }
}
