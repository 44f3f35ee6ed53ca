use serde::{Deserialize, Serialize};

use crate::{FrameDims, TargetEstimate};

/// Normalized target offset from frame center, each axis in [-1, 1].
/// Positive dx: target right of center. Positive dy: target below center.
/// Positive size_error: target appears larger than the setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlOffset {
    pub dx: f32,
    pub dy: f32,
    pub size_error: f32,
}

pub fn translate(est: &TargetEstimate, dims: FrameDims, size_setpoint: f32) -> ControlOffset {
    let (cx, cy) = dims.center();
    ControlOffset {
        dx: unit(ratio(est.cx - cx, cx)),
        dy: unit(ratio(est.cy - cy, cy)),
        size_error: unit(ratio(est.size - size_setpoint, size_setpoint)),
    }
}

/// Rough range from apparent size (`k / sqrt(area)`), display only.
pub fn estimate_range(size: f32, range_constant: f32) -> Option<f32> {
    if size > 0.0 && size.is_finite() {
        Some(range_constant / size)
    } else {
        None
    }
}

fn ratio(num: f32, den: f32) -> f32 {
    if den == 0.0 { 0.0 } else { num / den }
}

fn unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) }
}
