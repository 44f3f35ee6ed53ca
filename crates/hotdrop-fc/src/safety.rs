use hotdrop_proto::Command;
use std::time::{Duration, Instant};

/// Suppresses re-sending the same actuation faster than the link or the
/// actuator can use it.
#[derive(Debug)]
pub struct CommandRateLimit {
    last: Option<(Command, Instant)>,
    min_interval: Duration,
}

impl CommandRateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self { last: None, min_interval }
    }

    pub fn allow(&self, cmd: &Command, now: Instant) -> bool {
        if self.min_interval.is_zero() || cmd.kind.is_critical() {
            return true;
        }
        match &self.last {
            Some((prev, t)) if prev.same_action(cmd) => now.duration_since(*t) >= self.min_interval,
            _ => true,
        }
    }

    pub fn record(&mut self, cmd: &Command, now: Instant) {
        self.last = Some((*cmd, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotdrop_proto::{CommandKind, Magnitude};

    #[test]
    fn repeats_inside_window_are_suppressed() {
        let mut rl = CommandRateLimit::new(Duration::from_secs(2));
        let t0 = Instant::now();
        let a = Command::movement(CommandKind::MoveLeft, Magnitude::Small, 0.1, 1);
        assert!(rl.allow(&a, t0));
        rl.record(&a, t0);

        let again = Command::movement(CommandKind::MoveLeft, Magnitude::Small, 0.12, 2);
        assert!(!rl.allow(&again, t0 + Duration::from_millis(500)));
        assert!(rl.allow(&again, t0 + Duration::from_secs(2)));

        let other = Command::movement(CommandKind::MoveLeft, Magnitude::Medium, 0.3, 3);
        assert!(rl.allow(&other, t0 + Duration::from_millis(500)));
    }

    #[test]
    fn drop_is_never_suppressed() {
        let mut rl = CommandRateLimit::new(Duration::from_secs(2));
        let t0 = Instant::now();
        rl.record(&Command::drop_payload(1), t0);
        assert!(rl.allow(&Command::drop_payload(2), t0));
    }

    #[test]
    fn zero_interval_disables() {
        let mut rl = CommandRateLimit::new(Duration::ZERO);
        let t0 = Instant::now();
        rl.record(&Command::hold(1), t0);
        assert!(rl.allow(&Command::hold(2), t0));
    }
}
