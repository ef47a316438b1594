//! Safety Supervisor (§4.E): the single point of coordinate validation and
//! emergency fan-out.

use crate::config::Envelope;
use crate::error::RobotError;
use crate::plc::{PlcDriver, StatusCode};
use crate::robot::{Pose, RobotDriver};
use std::sync::Arc;
use tracing::error;

/// Stateless: one predicate, one side-effecting operation. Drivers MAY
/// re-validate but MUST NOT relax the envelope this enforces.
pub struct SafetySupervisor {
    envelope: Envelope,
}

impl SafetySupervisor {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn validate(&self, pose: &Pose) -> Result<(), RobotError> {
        pose.validate(&self.envelope)
    }

    /// Fans out immediate stop to both drivers in parallel, writes
    /// `StatusCode::EmergencyStop`, and sets the E-stop marker bit. Bridge
    /// motion dispatch stays suppressed until the Bridge observes the E-stop
    /// bit fall (§4.F owns that latch).
    pub async fn emergency(&self, robot: &Arc<RobotDriver>, plc: &PlcDriver) {
        let robot_stop = robot.emergency_stop();
        let plc_status = plc.write_status(StatusCode::EmergencyStop);
        let (robot_result, status_result) = tokio::join!(robot_stop, plc_status);

        if let Err(e) = robot_result {
            error!(error = %e, "robot emergency stop failed");
        }
        if let Err(e) = status_result {
            error!(error = %e, "writing EmergencyStop status failed");
        }
        if let Err(e) = plc
            .write_control_bits(crate::plc::ControlBitsPatch {
                estop: Some(true),
                ..Default::default()
            })
            .await
        {
            error!(error = %e, "writing E-stop marker bit failed");
        }
    }
}
