use hotdrop_proto::Command;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::info;

use crate::{Transport, TransportError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Probability in [0, 1] that an attempt is dropped before leaving.
    pub failure_rate: f32,
    /// Fixed seed for replayable runs.
    pub seed: Option<u64>,
}

/// Commands kept for inspection; older ones are only counted.
pub const SIM_HISTORY: usize = 64;

/// Dry-run transport: logs every command and keeps the most recent ones.
pub struct SimTransport {
    failure_rate: f32,
    rng: StdRng,
    recent: VecDeque<Command>,
    sent_count: u64,
}

impl SimTransport {
    pub fn new(cfg: SimConfig) -> Self {
        let rng = match cfg.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { failure_rate: cfg.failure_rate.clamp(0.0, 1.0), rng, recent: VecDeque::with_capacity(SIM_HISTORY), sent_count: 0 }
    }

    /// Up to `SIM_HISTORY` most recent commands, oldest first.
    pub fn sent(&self) -> impl Iterator<Item = &Command> + '_ {
        self.recent.iter()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }
}

impl Transport for SimTransport {
    fn name(&self) -> &str {
        "sim"
    }

    fn raw_send(&mut self, cmd: &Command) -> Result<(), TransportError> {
        if self.failure_rate > 0.0 && self.rng.gen::<f32>() < self.failure_rate {
            return Err(TransportError::NotSent("simulated link drop".into()));
        }
        info!("sim: {}", cmd);
        if self.recent.len() == SIM_HISTORY {
            self.recent.pop_front();
        }
        self.recent.push_back(*cmd);
        self.sent_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotdrop_proto::CommandKind;

    #[test]
    fn records_sent_commands() {
        let mut t = SimTransport::new(SimConfig::default());
        t.raw_send(&Command::hold(1)).unwrap();
        t.raw_send(&Command::drop_payload(2)).unwrap();
        let kinds: Vec<_> = t.sent().map(|c| c.kind).collect();
        assert_eq!(kinds, [CommandKind::Hold, CommandKind::Drop]);
        assert_eq!(t.sent_count(), 2);
    }

    #[test]
    fn long_runs_keep_bounded_history() {
        let mut t = SimTransport::new(SimConfig::default());
        for i in 1..=10_000 {
            t.raw_send(&Command::hold(i)).unwrap();
        }
        assert_eq!(t.sent_count(), 10_000);
        assert_eq!(t.sent().count(), SIM_HISTORY);
        assert_eq!(t.sent().next().map(|c| c.sequence_id), Some(10_000 - SIM_HISTORY as u64 + 1));
        assert_eq!(t.sent().last().map(|c| c.sequence_id), Some(10_000));
    }

    #[test]
    fn always_failing_link() {
        let mut t = SimTransport::new(SimConfig { failure_rate: 1.0, seed: Some(7) });
        assert!(matches!(t.raw_send(&Command::hold(1)), Err(TransportError::NotSent(_))));
        assert_eq!(t.sent().count(), 0);
        assert_eq!(t.sent_count(), 0);
    }

    #[test]
    fn seeded_runs_repeat() {
        let run = || {
            let mut t = SimTransport::new(SimConfig { failure_rate: 0.5, seed: Some(42) });
            (0..32).map(|i| t.raw_send(&Command::hold(i)).is_ok()).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
