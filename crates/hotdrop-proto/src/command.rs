use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    MoveLeft,
    MoveRight,
    MoveForward,
    MoveBack,
    MoveUp,
    MoveDown,
    Hold,
    Drop,
    Abort,
}

impl CommandKind {
    pub fn is_movement(self) -> bool {
        matches!(
            self,
            CommandKind::MoveLeft
                | CommandKind::MoveRight
                | CommandKind::MoveForward
                | CommandKind::MoveBack
                | CommandKind::MoveUp
                | CommandKind::MoveDown
        )
    }

    /// Commands that must never be retried blindly or suppressed as duplicates.
    pub fn is_critical(self) -> bool {
        matches!(self, CommandKind::Drop | CommandKind::Abort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::MoveLeft => "MOVE_LEFT",
            CommandKind::MoveRight => "MOVE_RIGHT",
            CommandKind::MoveForward => "MOVE_FORWARD",
            CommandKind::MoveBack => "MOVE_BACK",
            CommandKind::MoveUp => "MOVE_UP",
            CommandKind::MoveDown => "MOVE_DOWN",
            CommandKind::Hold => "HOLD",
            CommandKind::Drop => "DROP",
            CommandKind::Abort => "ABORT",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Magnitude {
    Small,
    Medium,
    Large,
}

/// One actuation request. `level` is the continuous |offset| (0..1) that
/// produced the tier; zero for HOLD/DROP/ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub magnitude: Option<Magnitude>,
    pub level: f32,
    pub sequence_id: u64,
}

impl Command {
    pub fn movement(kind: CommandKind, magnitude: Magnitude, level: f32, sequence_id: u64) -> Self {
        Self { kind, magnitude: Some(magnitude), level: level.clamp(0.0, 1.0), sequence_id }
    }

    pub fn hold(sequence_id: u64) -> Self {
        Self { kind: CommandKind::Hold, magnitude: None, level: 0.0, sequence_id }
    }

    pub fn drop_payload(sequence_id: u64) -> Self {
        Self { kind: CommandKind::Drop, magnitude: None, level: 0.0, sequence_id }
    }

    pub fn abort(sequence_id: u64) -> Self {
        Self { kind: CommandKind::Abort, magnitude: None, level: 0.0, sequence_id }
    }

    /// Same actuation regardless of sequence id.
    pub fn same_action(&self, other: &Command) -> bool {
        self.kind == other.kind && self.magnitude == other.magnitude
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.magnitude {
            Some(m) => write!(f, "#{} {} {:?} ({:.2})", self.sequence_id, self.kind, m, self.level),
            None => write!(f, "#{} {}", self.sequence_id, self.kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionPhase {
    Search,
    Approach,
    Align,
    Hold,
    Drop,
    Done,
    Aborted,
}

impl MissionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionPhase::Done | MissionPhase::Aborted)
    }

    /// Phases in which a target is being tracked and may be lost.
    pub fn is_tracking(self) -> bool {
        matches!(self, MissionPhase::Approach | MissionPhase::Align | MissionPhase::Hold)
    }
}

impl fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionPhase::Search => "SEARCH",
            MissionPhase::Approach => "APPROACH",
            MissionPhase::Align => "ALIGN",
            MissionPhase::Hold => "HOLD",
            MissionPhase::Drop => "DROP",
            MissionPhase::Done => "DONE",
            MissionPhase::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelErrorKind {
    /// Transport reported the command was not sent; retried.
    Transient,
    /// Transport cannot tell whether the command reached the drone.
    Ambiguous,
    /// Attempts stopped because the per-command deadline passed.
    Timeout,
    /// Transport refused the command; retrying cannot help.
    Rejected,
    /// Link is gone.
    Disconnected,
}

impl ChannelErrorKind {
    /// Failures the mission may survive by re-issuing on a later tick.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ChannelErrorKind::Transient | ChannelErrorKind::Ambiguous | ChannelErrorKind::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResult {
    pub delivered: bool,
    pub attempts: u32,
    pub last_error: Option<ChannelErrorKind>,
    /// Identical command already delivered inside the repeat window; nothing was sent.
    #[serde(default)]
    pub throttled: bool,
}

impl ChannelResult {
    pub fn delivered(attempts: u32) -> Self {
        Self { delivered: true, attempts, last_error: None, throttled: false }
    }

    pub fn failed(attempts: u32, err: ChannelErrorKind) -> Self {
        Self { delivered: false, attempts, last_error: Some(err), throttled: false }
    }

    pub fn throttled() -> Self {
        Self { delivered: true, attempts: 0, last_error: None, throttled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kind_serializes_screaming_case() {
        let cmd = Command::movement(CommandKind::MoveLeft, Magnitude::Small, 0.1, 7);
        let s = serde_json::to_string(&cmd).unwrap();
        assert!(s.contains("\"MOVE_LEFT\""));
        assert!(s.contains("\"SMALL\""));
    }

    #[test]
    fn movement_level_is_clamped() {
        let cmd = Command::movement(CommandKind::MoveUp, Magnitude::Large, 3.0, 1);
        assert_eq!(cmd.level, 1.0);
    }

    #[test]
    fn same_action_ignores_sequence() {
        let a = Command::hold(1);
        let b = Command::hold(2);
        assert!(a.same_action(&b));
        assert!(!a.same_action(&Command::drop_payload(3)));
    }

    #[test]
    fn terminal_phases() {
        assert!(MissionPhase::Done.is_terminal());
        assert!(MissionPhase::Aborted.is_terminal());
        assert!(!MissionPhase::Drop.is_terminal());
        assert!(!MissionPhase::Search.is_tracking());
        assert!(MissionPhase::Hold.is_tracking());
    }

    #[test]
    fn rejected_is_not_recoverable() {
        assert!(!ChannelErrorKind::Rejected.is_recoverable());
        assert!(!ChannelErrorKind::Disconnected.is_recoverable());
        assert!(ChannelErrorKind::Timeout.is_recoverable());
    }
}
