pub mod doctor;
pub mod mapper;
pub mod mission;
pub mod status;

use hotdrop_proto::Magnitude;
use hotdrop_vision::{FilterConfig, FrameDims};
use serde::Deserialize;
use std::time::Duration;

pub use doctor::ConfigError;
pub use mapper::CommandMapper;
pub use mission::{MissionStateMachine, PhaseTransition, TickOutcome};
pub use status::{AbortReason, AbortSignal, MissionStatus};

/// Tolerance band around zero plus the SMALL/MEDIUM/LARGE tier edges.
/// |v| <= epsilon is centered; (epsilon, medium] SMALL; (medium, large] MEDIUM; above LARGE.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Deadband {
    pub epsilon: f32,
    pub medium: f32,
    pub large: f32,
}

impl Deadband {
    pub fn contains(&self, v: f32) -> bool {
        v.abs() <= self.epsilon
    }

    pub fn tier(&self, v: f32) -> Option<Magnitude> {
        let a = v.abs();
        if a <= self.epsilon {
            None
        } else if a <= self.medium {
            Some(Magnitude::Small)
        } else if a <= self.large {
            Some(Magnitude::Medium)
        } else {
            Some(Magnitude::Large)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Applied to dx and dy.
    pub lateral: Deadband,
    /// Applied to size_error.
    pub size: Deadband,
    /// Consecutive fully centered HOLD ticks before DROP.
    pub drop_confirm_ticks: u32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            lateral: Deadband { epsilon: 0.1, medium: 0.3, large: 0.6 },
            size: Deadband { epsilon: 0.1, medium: 0.3, large: 0.6 },
            drop_confirm_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// APPROACH -> ALIGN after this many laterally centered ticks.
    pub align_ticks: u32,
    /// ALIGN -> HOLD after this many fully centered ticks.
    pub hold_ticks: u32,
    /// Apparent target size (px) at release height.
    pub size_setpoint: f32,
    /// `range = range_constant / size`, reported only.
    pub range_constant: f32,
    pub max_mission_duration_s: f32,
    /// Failed movement ticks in a row before giving up. 0 = never.
    pub max_consecutive_failures: u32,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            align_ticks: 5,
            hold_ticks: 5,
            size_setpoint: 120.0,
            range_constant: 50_000.0,
            max_mission_duration_s: 300.0,
            max_consecutive_failures: 0,
        }
    }
}

impl MissionConfig {
    pub fn max_mission_duration(&self) -> Duration {
        Duration::try_from_secs_f32(self.max_mission_duration_s.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Everything the control loop needs, validated together.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub frame: FrameDims,
    pub filter: FilterConfig,
    pub mapper: MapperConfig,
    pub mission: MissionConfig,
}
