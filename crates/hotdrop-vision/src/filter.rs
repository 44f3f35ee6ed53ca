use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Detection;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum detector confidence for a reading to update the estimate.
    pub confidence_threshold: f32,
    /// Ticks an estimate stays MARGINAL after the last good reading.
    pub grace_frames: u32,
    /// EWMA weight of the new reading (1.0 = raw detections).
    pub smoothing: f32,
    /// Contour detectors only: reject blobs that are not round enough.
    pub min_circularity: Option<f32>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            grace_frames: 5,
            smoothing: 0.4,
            min_circularity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetQuality {
    Confident,
    Marginal,
    Lost,
}

impl TargetQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetQuality::Confident => "CONFIDENT",
            TargetQuality::Marginal => "MARGINAL",
            TargetQuality::Lost => "LOST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetEstimate {
    pub cx: f32,
    pub cy: f32,
    pub size: f32,
    pub quality: TargetQuality,
    pub frames_since_seen: u32,
}

impl TargetEstimate {
    pub fn is_usable(&self) -> bool {
        self.quality != TargetQuality::Lost
    }
}

#[derive(Debug, Clone, Copy)]
struct Smoothed {
    cx: f32,
    cy: f32,
    size: f32,
}

/// Debounces the raw detection stream into a single target estimate.
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    cfg: FilterConfig,
    est: Option<Smoothed>,
    frames_since_seen: u32,
    quality: TargetQuality,
}

impl DetectionFilter {
    pub fn new(cfg: FilterConfig) -> Self {
        Self { cfg, est: None, frames_since_seen: 0, quality: TargetQuality::Lost }
    }

    pub fn quality(&self) -> TargetQuality {
        self.quality
    }

    pub fn reset(&mut self) {
        self.est = None;
        self.frames_since_seen = 0;
        self.quality = TargetQuality::Lost;
    }

    pub fn update(&mut self, det: Option<&Detection>) -> TargetEstimate {
        match det.filter(|d| self.qualifies(d)) {
            Some(d) => self.accept(d),
            None => self.miss(det.is_some()),
        }

        let s = self.est.unwrap_or(Smoothed { cx: 0.0, cy: 0.0, size: 0.0 });
        TargetEstimate {
            cx: s.cx,
            cy: s.cy,
            size: s.size,
            quality: self.quality,
            frames_since_seen: self.frames_since_seen,
        }
    }

    fn qualifies(&self, d: &Detection) -> bool {
        if !(d.conf >= self.cfg.confidence_threshold) {
            return false;
        }
        if !(d.cx.is_finite() && d.cy.is_finite() && d.size() > 0.0) {
            return false;
        }
        match (self.cfg.min_circularity, d.circularity) {
            (Some(min), Some(c)) => c > min,
            _ => true,
        }
    }

    fn accept(&mut self, d: &Detection) {
        let raw = Smoothed { cx: d.cx, cy: d.cy, size: d.size() };
        let a = self.cfg.smoothing.clamp(f32::EPSILON, 1.0);

        self.est = match self.est {
            // Stale estimates must not bias a fresh acquisition.
            Some(prev) if self.quality != TargetQuality::Lost => Some(Smoothed {
                cx: a * raw.cx + (1.0 - a) * prev.cx,
                cy: a * raw.cy + (1.0 - a) * prev.cy,
                size: a * raw.size + (1.0 - a) * prev.size,
            }),
            _ => Some(raw),
        };

        if self.quality != TargetQuality::Confident {
            debug!("filter: target confident (was {})", self.quality.as_str());
        }
        self.frames_since_seen = 0;
        self.quality = TargetQuality::Confident;
    }

    fn miss(&mut self, rejected: bool) {
        self.frames_since_seen = self.frames_since_seen.saturating_add(1);
        let next = if self.est.is_some() && self.frames_since_seen <= self.cfg.grace_frames {
            TargetQuality::Marginal
        } else {
            TargetQuality::Lost
        };
        if next != self.quality {
            debug!(
                "filter: {} -> {} after {} frames (rejected={})",
                self.quality.as_str(),
                next.as_str(),
                self.frames_since_seen,
                rejected
            );
        }
        self.quality = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cfg(grace: u32) -> FilterConfig {
        FilterConfig { confidence_threshold: 0.5, grace_frames: grace, smoothing: 0.5, min_circularity: None }
    }

    fn det(cx: f32, conf: f32) -> Detection {
        Detection::circle(cx, 100.0, 10.0, conf, 0)
    }

    #[test]
    fn starts_lost() {
        let mut f = DetectionFilter::new(cfg(2));
        assert_eq!(f.quality(), TargetQuality::Lost);
        assert_eq!(f.update(None).quality, TargetQuality::Lost);
    }

    #[test]
    fn low_confidence_decays_to_lost_and_stays() {
        let mut f = DetectionFilter::new(cfg(3));
        assert_eq!(f.update(Some(&det(100.0, 0.9))).quality, TargetQuality::Confident);

        for i in 1..=3 {
            let e = f.update(Some(&det(100.0, 0.2)));
            assert_eq!(e.quality, TargetQuality::Marginal, "tick {i}");
            assert_eq!(e.frames_since_seen, i);
        }
        for _ in 0..10 {
            assert_eq!(f.update(Some(&det(100.0, 0.49))).quality, TargetQuality::Lost);
        }
        assert_eq!(f.update(Some(&det(100.0, 0.5))).quality, TargetQuality::Confident);
    }

    #[test]
    fn marginal_holds_last_estimate() {
        let mut f = DetectionFilter::new(cfg(2));
        f.update(Some(&det(200.0, 0.9)));
        let e = f.update(None);
        assert_eq!(e.quality, TargetQuality::Marginal);
        assert_relative_eq!(e.cx, 200.0);
    }

    #[test]
    fn smooths_position() {
        let mut f = DetectionFilter::new(cfg(2));
        f.update(Some(&det(100.0, 0.9)));
        let e = f.update(Some(&det(200.0, 0.9)));
        assert_relative_eq!(e.cx, 150.0);
    }

    #[test]
    fn reseeds_after_lost() {
        let mut f = DetectionFilter::new(cfg(0));
        f.update(Some(&det(100.0, 0.9)));
        assert_eq!(f.update(None).quality, TargetQuality::Lost);
        let e = f.update(Some(&det(400.0, 0.9)));
        assert_relative_eq!(e.cx, 400.0);
    }

    #[test]
    fn rejects_non_circular_blobs() {
        let mut f = DetectionFilter::new(FilterConfig { min_circularity: Some(0.8), ..cfg(1) });
        let mut d = det(100.0, 0.9);
        d.circularity = Some(0.6);
        assert_eq!(f.update(Some(&d)).quality, TargetQuality::Lost);
        d.circularity = Some(0.95);
        assert_eq!(f.update(Some(&d)).quality, TargetQuality::Confident);
    }

    #[test]
    fn reset_forgets_target() {
        let mut f = DetectionFilter::new(cfg(5));
        f.update(Some(&det(100.0, 0.9)));
        f.reset();
        assert_eq!(f.update(None).quality, TargetQuality::Lost);
    }
}
