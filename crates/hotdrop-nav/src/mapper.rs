use hotdrop_proto::{Command, CommandKind, MissionPhase};
use hotdrop_vision::ControlOffset;
use tracing::info;

use crate::MapperConfig;

/// Turns a control offset into one command per tick.
///
/// Lateral error is corrected before range error; of the two lateral axes
/// the larger offset goes first. DROP is only produced in HOLD, after
/// `drop_confirm_ticks` fully centered calls, and at most once.
#[derive(Debug, Clone)]
pub struct CommandMapper {
    cfg: MapperConfig,
    last_seq: u64,
    centered_ticks: u32,
    drop_issued: bool,
}

impl CommandMapper {
    pub fn new(cfg: MapperConfig) -> Self {
        Self { cfg, last_seq: 0, centered_ticks: 0, drop_issued: false }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.cfg
    }

    pub fn drop_issued(&self) -> bool {
        self.drop_issued
    }

    pub fn is_laterally_centered(&self, o: &ControlOffset) -> bool {
        self.cfg.lateral.contains(o.dx) && self.cfg.lateral.contains(o.dy)
    }

    pub fn is_centered(&self, o: &ControlOffset) -> bool {
        self.is_laterally_centered(o) && self.cfg.size.contains(o.size_error)
    }

    /// Restart the DROP confirmation count.
    pub fn interrupt_hold(&mut self) {
        self.centered_ticks = 0;
    }

    pub fn hold(&mut self) -> Command {
        Command::hold(self.next_seq())
    }

    pub fn abort(&mut self) -> Command {
        Command::abort(self.next_seq())
    }

    pub fn map(&mut self, o: &ControlOffset, phase: MissionPhase) -> Command {
        match phase {
            MissionPhase::Approach | MissionPhase::Align => match self.correction(o) {
                Some(cmd) => cmd,
                None => self.hold(),
            },
            MissionPhase::Hold => {
                if let Some(cmd) = self.correction(o) {
                    self.centered_ticks = 0;
                    return cmd;
                }
                if self.drop_issued {
                    return self.hold();
                }
                self.centered_ticks += 1;
                if self.centered_ticks >= self.cfg.drop_confirm_ticks {
                    self.drop_issued = true;
                    let cmd = Command::drop_payload(self.next_seq());
                    info!("mapper: centered for {} ticks, issuing {}", self.centered_ticks, cmd);
                    return cmd;
                }
                self.hold()
            }
            // no target acquired, or nothing left to steer
            MissionPhase::Search | MissionPhase::Drop | MissionPhase::Done | MissionPhase::Aborted => self.hold(),
        }
    }

    fn correction(&mut self, o: &ControlOffset) -> Option<Command> {
        let (v, kind) = if o.dx.abs() >= o.dy.abs() {
            (o.dx, if o.dx > 0.0 { CommandKind::MoveRight } else { CommandKind::MoveLeft })
        } else {
            (o.dy, if o.dy > 0.0 { CommandKind::MoveDown } else { CommandKind::MoveUp })
        };
        if let Some(m) = self.cfg.lateral.tier(v) {
            return Some(Command::movement(kind, m, v.abs(), self.next_seq()));
        }

        let e = o.size_error;
        let m = self.cfg.size.tier(e)?;
        // too big means too close
        let kind = if e > 0.0 { CommandKind::MoveBack } else { CommandKind::MoveForward };
        Some(Command::movement(kind, m, e.abs(), self.next_seq()))
    }

    fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }
}
