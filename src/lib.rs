//! Dobot Magician ⇄ Siemens S7-1200 bridge
//!
//! Translates PLC intent (control bits, target coordinates) into robot
//! motions over a framed binary protocol, mirrors robot feedback back into
//! PLC memory, and enforces safety.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod error;
pub mod frame;
pub mod plc;
pub mod robot;
pub mod safety;
pub mod telemetry;
pub mod transport;

pub use adapter::{AdapterEvent, ExternalAdapter};
pub use bridge::{Bridge, BridgeHandle, BridgeSnapshot, BridgeState};
pub use config::Config;
pub use error::{AdapterError, BridgeError, ErrorKind, Result};
pub use plc::PlcDriver;
pub use robot::{Pose, RobotDriver};
pub use safety::SafetySupervisor;
