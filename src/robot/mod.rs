//! Robot Driver (§4.C): typed request/response, queue management, alarm ops.

pub mod commands;
pub mod driver;
pub mod pose;

pub use commands::{MoveMode, RobotStatus, WaitOutcome};
pub use driver::RobotDriver;
pub use pose::Pose;
