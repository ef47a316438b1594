//! Pose type and envelope validation (§3).

use crate::config::Envelope;
use crate::error::RobotError;
use serde::{Deserialize, Serialize};

/// (x, y, z, r) in millimeters/degrees, 32-bit float.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub r: f32,
}

impl Pose {
    pub fn new(x: f32, y: f32, z: f32, r: f32) -> Self {
        Self { x, y, z, r }
    }

    /// Largest per-axis absolute difference between two poses.
    pub fn max_abs_diff(&self, other: &Pose) -> f32 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
            .max((self.r - other.r).abs())
    }

    /// Validates against the configured workspace envelope (§4.E).
    pub fn validate(&self, envelope: &Envelope) -> Result<(), RobotError> {
        check_axis("x", self.x, envelope.x.min, envelope.x.max)?;
        check_axis("y", self.y, envelope.y.min, envelope.y.max)?;
        check_axis("z", self.z, envelope.z.min, envelope.z.max)?;
        check_axis("r", self.r, envelope.r.min, envelope.r.max)?;
        Ok(())
    }
}

fn check_axis(axis: &'static str, value: f32, min: f32, max: f32) -> Result<(), RobotError> {
    if value < min {
        return Err(RobotError::OutOfEnvelope {
            axis,
            value,
            bound: min,
        });
    }
    if value > max {
        return Err(RobotError::OutOfEnvelope {
            axis,
            value,
            bound: max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AxisRange;

    fn envelope() -> Envelope {
        Envelope {
            x: AxisRange {
                min: -300.0,
                max: 300.0,
            },
            y: AxisRange {
                min: -300.0,
                max: 300.0,
            },
            z: AxisRange {
                min: -100.0,
                max: 400.0,
            },
            r: AxisRange {
                min: -180.0,
                max: 180.0,
            },
        }
    }

    #[test]
    fn rejects_pose_outside_envelope_per_scenario_s6() {
        let pose = Pose::new(400.0, 0.0, 100.0, 0.0);
        let err = pose.validate(&envelope()).unwrap_err();
        match err {
            RobotError::OutOfEnvelope { axis, value, bound } => {
                assert_eq!(axis, "x");
                assert_eq!(value, 400.0);
                assert_eq!(bound, 300.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_pose_within_envelope() {
        let pose = Pose::new(250.0, 0.0, 100.0, 0.0);
        assert!(pose.validate(&envelope()).is_ok());
    }
}
