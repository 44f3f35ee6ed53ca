pub mod filter;
pub mod offset;
pub mod replay;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use filter::{DetectionFilter, FilterConfig, TargetEstimate, TargetQuality};
pub use offset::{estimate_range, translate, ControlOffset};

/// One hotspot candidate reported by the external detector, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub conf: f32,
    /// 4*pi*area/perimeter^2 when the detector works on contours.
    #[serde(default)]
    pub circularity: Option<f32>,
    #[serde(default)]
    pub ts_ms: u64,
}

impl Detection {
    pub fn circle(cx: f32, cy: f32, r: f32, conf: f32, ts_ms: u64) -> Self {
        Self { cx, cy, w: 2.0 * r, h: 2.0 * r, conf, circularity: None, ts_ms }
    }

    /// Apparent size: side of the square with the same area as the box.
    pub fn size(&self) -> f32 {
        (self.w.max(0.0) * self.h.max(0.0)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl Default for FrameDims {
    fn default() -> Self {
        Self { width: 640, height: 640 }
    }
}

/// Everything the detector reported for one processed frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    pub ts_ms: u64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Frame {
    pub fn target(&self) -> Option<Detection> {
        select_target(&self.detections)
    }
}

/// Pull source of per-frame detections.
pub trait Detector: Send {
    fn frame_dims(&self) -> FrameDims;

    /// `Ok(None)` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Single target of interest: the most confident detection in the frame.
pub fn select_target(dets: &[Detection]) -> Option<Detection> {
    dets.iter()
        .filter(|d| d.conf.is_finite())
        .max_by(|a, b| a.conf.partial_cmp(&b.conf).unwrap_or(std::cmp::Ordering::Equal))
        .copied()
}
