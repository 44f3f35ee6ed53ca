use std::time::Duration;

use hotdrop_fc::ChannelConfig;

use crate::{ControlConfig, Deadband};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("{axis} deadband must satisfy 0 <= epsilon < medium < large, got {epsilon} / {medium} / {large}")]
    DeadbandOrder { axis: &'static str, epsilon: f32, medium: f32, large: f32 },
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange { field, reason: reason.into() }
}

pub fn check_deadband(axis: &'static str, db: &Deadband) -> Result<(), ConfigError> {
    let ordered = db.epsilon >= 0.0 && db.epsilon < db.medium && db.medium < db.large;
    if !ordered {
        return Err(ConfigError::DeadbandOrder { axis, epsilon: db.epsilon, medium: db.medium, large: db.large });
    }
    Ok(())
}

/// Rejects parameter combinations the control loop cannot run with.
pub fn check_control(cfg: &ControlConfig) -> Result<(), ConfigError> {
    if !cfg.frame.is_valid() {
        return Err(out_of_range("frame", format!("{}x{} has no area", cfg.frame.width, cfg.frame.height)));
    }

    let f = &cfg.filter;
    if !(0.0..=1.0).contains(&f.confidence_threshold) {
        return Err(out_of_range("filter.confidence_threshold", "must be within 0..=1"));
    }
    if !(f.smoothing > 0.0 && f.smoothing <= 1.0) {
        return Err(out_of_range("filter.smoothing", "must be within (0, 1]"));
    }
    if let Some(c) = f.min_circularity {
        if !(0.0..=1.0).contains(&c) {
            return Err(out_of_range("filter.min_circularity", "must be within 0..=1"));
        }
    }

    check_deadband("lateral", &cfg.mapper.lateral)?;
    check_deadband("size", &cfg.mapper.size)?;
    if cfg.mapper.drop_confirm_ticks == 0 {
        return Err(out_of_range("mapper.drop_confirm_ticks", "must be >= 1"));
    }

    let m = &cfg.mission;
    if m.align_ticks == 0 {
        return Err(out_of_range("mission.align_ticks", "must be >= 1"));
    }
    if m.hold_ticks == 0 {
        return Err(out_of_range("mission.hold_ticks", "must be >= 1"));
    }
    if !(m.size_setpoint > 0.0 && m.size_setpoint.is_finite()) {
        return Err(out_of_range("mission.size_setpoint", "must be a positive size in pixels"));
    }
    if !(m.max_mission_duration_s > 0.0 && m.max_mission_duration_s.is_finite()) {
        return Err(out_of_range("mission.max_mission_duration_s", "must be positive"));
    }
    if Duration::try_from_secs_f32(m.max_mission_duration_s).is_err() {
        return Err(out_of_range("mission.max_mission_duration_s", "too large for a duration"));
    }
    Ok(())
}

pub fn check_channel(c: &ChannelConfig) -> Result<(), ConfigError> {
    if c.max_attempts == 0 {
        return Err(out_of_range("channel.max_attempts", "must be >= 1"));
    }
    if c.timeout_ms == 0 {
        return Err(out_of_range("channel.timeout_ms", "must be > 0"));
    }
    if c.backoff_factor < 1.0 {
        return Err(out_of_range("channel.backoff_factor", "must be >= 1"));
    }
    if c.backoff_max_ms < c.backoff_initial_ms {
        return Err(out_of_range("channel.backoff_max_ms", "must be >= backoff_initial_ms"));
    }
    if !(0.0..=1.0).contains(&c.jitter) {
        return Err(out_of_range("channel.jitter", "must be within 0..=1"));
    }
    Ok(())
}
