use serde::{Deserialize, Serialize};

use crate::command::{ChannelResult, Command, MissionPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Tick,
    PhaseChange,
    Drop,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionEvent {
    pub ts_unix_ms: i64,
    pub tick: u64,
    pub kind: EventKind,
    pub phase: MissionPhase,
    pub msg: String,
    // Target
    pub quality: Option<String>,
    pub dx: Option<f32>,
    pub dy: Option<f32>,
    pub size_error: Option<f32>,
    pub range_est: Option<f32>,
    // Actuation
    pub command: Option<Command>,
    pub result: Option<ChannelResult>,
}

impl MissionEvent {
    pub fn new(ts_unix_ms: i64, tick: u64, kind: EventKind, phase: MissionPhase, msg: impl Into<String>) -> Self {
        Self {
            ts_unix_ms,
            tick,
            kind,
            phase,
            msg: msg.into(),
            quality: None,
            dx: None,
            dy: None,
            size_error: None,
            range_est: None,
            command: None,
            result: None,
        }
    }
}
