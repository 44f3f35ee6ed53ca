use hotdrop_fc::{CommandChannel, Transport};
use hotdrop_proto::telemetry::{EventKind, MissionEvent};
use hotdrop_proto::{ChannelErrorKind, ChannelResult, Command, CommandKind, MissionPhase};
use hotdrop_vision::{estimate_range, translate, ControlOffset, Detection, DetectionFilter, TargetEstimate, TargetQuality};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::doctor::check_control;
use crate::status::{AbortReason, AbortSignal, MissionStatus};
use crate::{CommandMapper, ConfigError, ControlConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    pub tick: u64,
    pub from: MissionPhase,
    pub to: MissionPhase,
}

/// What one control tick saw and did.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub tick: u64,
    /// Phase after the tick.
    pub phase: MissionPhase,
    /// None when the tick stopped before reading the detection.
    pub estimate: Option<TargetEstimate>,
    pub offset: Option<ControlOffset>,
    pub range_est: Option<f32>,
    pub command: Option<Command>,
    pub result: Option<ChannelResult>,
    pub transitions: Vec<PhaseTransition>,
}

impl TickOutcome {
    pub fn event(&self, ts_unix_ms: i64) -> MissionEvent {
        let kind = match (&self.command, self.phase) {
            (Some(c), _) if c.kind == CommandKind::Drop => EventKind::Drop,
            (_, MissionPhase::Aborted) if !self.transitions.is_empty() => EventKind::Abort,
            _ if !self.transitions.is_empty() => EventKind::PhaseChange,
            _ => EventKind::Tick,
        };
        let msg = if self.transitions.is_empty() {
            format!("{}", self.phase)
        } else {
            self.transitions
                .iter()
                .map(|t| format!("{} -> {}", t.from, t.to))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut ev = MissionEvent::new(ts_unix_ms, self.tick, kind, self.phase, msg);
        ev.quality = self.estimate.map(|e| e.quality.as_str().to_string());
        if let Some(o) = self.offset {
            ev.dx = Some(o.dx);
            ev.dy = Some(o.dy);
            ev.size_error = Some(o.size_error);
        }
        ev.range_est = self.range_est;
        ev.command = self.command;
        ev.result = self.result;
        ev
    }
}

/// Owns the phase of one payload-drop mission.
///
/// One `tick` per camera frame: filter the detection, turn the estimate into
/// an offset, map it to a command, send it, then advance the phase from what
/// was actually delivered. Nothing here blocks except `CommandChannel::send`.
pub struct MissionStateMachine {
    cfg: ControlConfig,
    filter: DetectionFilter,
    mapper: CommandMapper,
    abort: AbortSignal,

    phase: MissionPhase,
    tick: u64,
    started: Option<Instant>,
    aligned_ticks: u32,
    centered_ticks: u32,
    consecutive_failures: u32,
    abort_reason: Option<AbortReason>,
    stop_sent: bool,

    transitions: Vec<PhaseTransition>,
    last_result: Option<ChannelResult>,
    status: Arc<Mutex<MissionStatus>>,
}

impl MissionStateMachine {
    pub fn new(cfg: &ControlConfig, abort: AbortSignal) -> Result<Self, ConfigError> {
        check_control(cfg)?;
        Ok(Self {
            cfg: cfg.clone(),
            filter: DetectionFilter::new(cfg.filter.clone()),
            mapper: CommandMapper::new(cfg.mapper.clone()),
            abort,
            phase: MissionPhase::Search,
            tick: 0,
            started: None,
            aligned_ticks: 0,
            centered_ticks: 0,
            consecutive_failures: 0,
            abort_reason: None,
            stop_sent: false,
            transitions: Vec::new(),
            last_result: None,
            status: Arc::new(Mutex::new(MissionStatus::default())),
        })
    }

    pub fn phase(&self) -> MissionPhase {
        self.phase
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    pub fn last_result(&self) -> Option<ChannelResult> {
        self.last_result
    }

    pub fn status_handle(&self) -> Arc<Mutex<MissionStatus>> {
        Arc::clone(&self.status)
    }

    pub fn tick<T: Transport>(&mut self, det: Option<&Detection>, now: Instant, channel: &mut CommandChannel<T>) -> TickOutcome {
        let first = self.transitions.len();
        let mut out = TickOutcome {
            tick: self.tick,
            phase: self.phase,
            estimate: None,
            offset: None,
            range_est: None,
            command: None,
            result: None,
            transitions: Vec::new(),
        };
        if self.phase.is_terminal() {
            return out;
        }

        self.tick += 1;
        out.tick = self.tick;
        let started = *self.started.get_or_insert(now);

        if self.abort.is_triggered() {
            self.enter_aborted(AbortReason::External);
            return self.finish(out, first);
        }
        if now.saturating_duration_since(started) >= self.cfg.mission.max_mission_duration() {
            self.enter_aborted(AbortReason::MissionTimeout);
            return self.finish(out, first);
        }

        let est = self.filter.update(det);
        out.estimate = Some(est);
        match (self.phase, est.quality) {
            (MissionPhase::Search, TargetQuality::Confident) => self.enter(MissionPhase::Approach),
            (p, TargetQuality::Lost) if p.is_tracking() => {
                info!("mission: target lost in {}", p);
                self.enter(MissionPhase::Search);
            }
            _ => {}
        }

        let offset = est
            .is_usable()
            .then(|| translate(&est, self.cfg.frame, self.cfg.mission.size_setpoint));
        out.offset = offset;
        out.range_est = est.is_usable().then(|| estimate_range(est.size, self.cfg.mission.range_constant)).flatten();

        let cmd = match offset {
            None => self.mapper.hold(),
            Some(_) if self.phase == MissionPhase::Search => self.mapper.hold(),
            // a coasting estimate must not confirm a release
            Some(_) if self.phase == MissionPhase::Hold && est.quality == TargetQuality::Marginal => {
                self.mapper.interrupt_hold();
                self.mapper.hold()
            }
            Some(o) => self.mapper.map(&o, self.phase),
        };
        if cmd.kind == CommandKind::Drop {
            self.enter(MissionPhase::Drop);
        }

        let res = channel.send(&cmd);
        debug!("mission: tick {} {} -> {:?}", self.tick, cmd, res);
        out.command = Some(cmd);
        out.result = Some(res);
        self.last_result = Some(res);

        if cmd.kind == CommandKind::Drop {
            if res.delivered {
                info!("mission: payload released after {} attempt(s)", res.attempts);
                self.enter(MissionPhase::Done);
            } else {
                let kind = res.last_error.unwrap_or(ChannelErrorKind::Ambiguous);
                self.enter_aborted(AbortReason::DropUnconfirmed(kind));
            }
        } else if res.delivered {
            self.consecutive_failures = 0;
            if let Some(o) = offset {
                self.advance(&o, est.quality);
            }
        } else {
            self.on_undelivered(&res);
        }

        self.publish(Some(cmd));
        self.finish(out, first)
    }

    /// Best-effort ABORT to the drone after an operator abort or a timeout.
    /// Sent at most once; never after an unconfirmed DROP.
    pub fn safe_stop<T: Transport>(&mut self, channel: &mut CommandChannel<T>) -> Option<ChannelResult> {
        let reason = self.abort_reason?;
        if self.stop_sent || !reason.allows_safe_stop() {
            return None;
        }
        self.stop_sent = true;
        let cmd = self.mapper.abort();
        let res = channel.send(&cmd);
        if res.delivered {
            info!("mission: {} delivered ({})", cmd, reason);
        } else {
            warn!("mission: {} not delivered ({:?})", cmd, res.last_error);
        }
        self.last_result = Some(res);
        self.publish(Some(cmd));
        Some(res)
    }

    fn advance(&mut self, o: &ControlOffset, quality: TargetQuality) {
        if quality != TargetQuality::Confident {
            return;
        }
        match self.phase {
            MissionPhase::Approach => {
                self.aligned_ticks = if self.mapper.is_laterally_centered(o) { self.aligned_ticks + 1 } else { 0 };
                if self.aligned_ticks >= self.cfg.mission.align_ticks {
                    self.enter(MissionPhase::Align);
                }
            }
            MissionPhase::Align => {
                self.centered_ticks = if self.mapper.is_centered(o) { self.centered_ticks + 1 } else { 0 };
                if self.centered_ticks >= self.cfg.mission.hold_ticks {
                    self.enter(MissionPhase::Hold);
                }
            }
            _ => {}
        }
    }

    fn on_undelivered(&mut self, res: &ChannelResult) {
        let kind = res.last_error.unwrap_or(ChannelErrorKind::Transient);
        self.mapper.interrupt_hold();
        if !kind.is_recoverable() {
            self.enter_aborted(AbortReason::ChannelFailure(kind));
            return;
        }
        self.consecutive_failures += 1;
        warn!("mission: command not delivered ({:?}), {} in a row", kind, self.consecutive_failures);
        let max = self.cfg.mission.max_consecutive_failures;
        if max > 0 && self.consecutive_failures > max {
            self.enter_aborted(AbortReason::TooManyFailures(self.consecutive_failures));
        }
    }

    fn enter(&mut self, to: MissionPhase) {
        let from = self.phase;
        if from == to {
            return;
        }
        info!("mission: {} -> {} (tick {})", from, to, self.tick);
        self.phase = to;
        self.aligned_ticks = 0;
        self.centered_ticks = 0;
        if to == MissionPhase::Search {
            self.mapper.interrupt_hold();
        }
        self.transitions.push(PhaseTransition { tick: self.tick, from, to });
    }

    fn enter_aborted(&mut self, reason: AbortReason) {
        error!("mission: aborted: {}", reason);
        self.abort_reason = Some(reason);
        self.enter(MissionPhase::Aborted);
        self.publish(None);
    }

    fn publish(&self, cmd: Option<Command>) {
        if let Ok(mut st) = self.status.lock() {
            st.phase = self.phase;
            st.ticks = self.tick;
            st.abort_reason = self.abort_reason;
            if cmd.is_some() {
                st.last_command = cmd;
                st.last_result = self.last_result;
            }
        }
    }

    fn finish(&self, mut out: TickOutcome, first: usize) -> TickOutcome {
        out.phase = self.phase;
        out.transitions = self.transitions[first..].to_vec();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotdrop_fc::{ChannelConfig, TransportError};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<Command>,
        /// Answer every DROP with an ambiguous failure.
        fail_drop: Option<String>,
    }

    impl Transport for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn raw_send(&mut self, cmd: &Command) -> Result<(), TransportError> {
            self.sent.push(*cmd);
            match (&self.fail_drop, cmd.kind) {
                (Some(msg), CommandKind::Drop) => Err(TransportError::Ambiguous(msg.clone())),
                _ => Ok(()),
            }
        }
    }

    fn channel(t: Recorder) -> CommandChannel<Recorder> {
        CommandChannel::new(t, &ChannelConfig::default()).with_sleep(|_| {})
    }

    fn fast_config() -> ControlConfig {
        let mut cfg = ControlConfig::default();
        cfg.filter.smoothing = 1.0;
        cfg.mission.align_ticks = 2;
        cfg.mission.hold_ticks = 2;
        cfg.mapper.drop_confirm_ticks = 2;
        cfg
    }

    fn centered(cfg: &ControlConfig) -> Detection {
        let (cx, cy) = cfg.frame.center();
        let side = cfg.mission.size_setpoint;
        Detection { cx, cy, w: side, h: side, conf: 0.9, circularity: None, ts_ms: 0 }
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = ControlConfig::default();
        cfg.mapper.drop_confirm_ticks = 0;
        assert!(MissionStateMachine::new(&cfg, AbortSignal::new()).is_err());

        let mut cfg = ControlConfig::default();
        cfg.mission.max_mission_duration_s = 1.0e30;
        assert!(MissionStateMachine::new(&cfg, AbortSignal::new()).is_err());
        assert_eq!(cfg.mission.max_mission_duration(), Duration::MAX);
    }

    #[test]
    fn search_holds_without_target() {
        let cfg = fast_config();
        let mut m = MissionStateMachine::new(&cfg, AbortSignal::new()).unwrap();
        let mut ch = channel(Recorder::default());
        let t0 = Instant::now();
        for i in 0..5 {
            let out = m.tick(None, t0 + Duration::from_millis(i * 100), &mut ch);
            assert_eq!(out.phase, MissionPhase::Search);
            assert_eq!(out.command.map(|c| c.kind), Some(CommandKind::Hold));
            assert!(out.offset.is_none());
        }
    }

    #[test]
    fn delivered_centered_ticks_reach_align() {
        let cfg = fast_config();
        let mut m = MissionStateMachine::new(&cfg, AbortSignal::new()).unwrap();
        let mut ch = channel(Recorder::default());
        let det = centered(&cfg);
        let t0 = Instant::now();

        m.tick(Some(&det), t0, &mut ch);
        assert_eq!(m.phase(), MissionPhase::Approach);
        m.tick(Some(&det), t0, &mut ch);
        assert_eq!(m.phase(), MissionPhase::Align);
    }

    #[test]
    fn marginal_target_never_releases() {
        let mut cfg = fast_config();
        cfg.filter.grace_frames = 100;
        let mut m = MissionStateMachine::new(&cfg, AbortSignal::new()).unwrap();
        let mut ch = channel(Recorder::default());
        let det = centered(&cfg);
        let t0 = Instant::now();

        while m.phase() != MissionPhase::Hold {
            m.tick(Some(&det), t0, &mut ch);
        }
        m.tick(Some(&det), t0, &mut ch);
        for _ in 0..20 {
            let out = m.tick(None, t0, &mut ch);
            assert_eq!(out.command.map(|c| c.kind), Some(CommandKind::Hold));
        }
        assert_eq!(m.phase(), MissionPhase::Hold);
        // one fresh reading after the gap is not enough on its own
        let out = m.tick(Some(&det), t0, &mut ch);
        assert_eq!(out.command.map(|c| c.kind), Some(CommandKind::Hold));
        let out = m.tick(Some(&det), t0, &mut ch);
        assert_eq!(out.command.map(|c| c.kind), Some(CommandKind::Drop));
    }

    #[test]
    fn unconfirmed_drop_skips_safe_stop() {
        let cfg = fast_config();
        let mut m = MissionStateMachine::new(&cfg, AbortSignal::new()).unwrap();
        let t = Recorder { fail_drop: Some("no ack".into()), ..Default::default() };
        let mut ch = channel(t);
        let det = centered(&cfg);
        let t0 = Instant::now();

        for _ in 0..10 {
            m.tick(Some(&det), t0, &mut ch);
        }
        assert_eq!(m.phase(), MissionPhase::Aborted);
        assert_eq!(m.abort_reason(), Some(AbortReason::DropUnconfirmed(ChannelErrorKind::Ambiguous)));
        assert!(m.safe_stop(&mut ch).is_none());

        let drops = ch.transport().sent.iter().filter(|c| c.kind == CommandKind::Drop).count();
        assert_eq!(drops, 1);
    }

    #[test]
    fn status_follows_phase() {
        let cfg = fast_config();
        let abort = AbortSignal::new();
        let mut m = MissionStateMachine::new(&cfg, abort.clone()).unwrap();
        let status = m.status_handle();
        let mut ch = channel(Recorder::default());
        let det = centered(&cfg);

        m.tick(Some(&det), Instant::now(), &mut ch);
        assert_eq!(status.lock().unwrap().phase, MissionPhase::Approach);
        abort.trigger();
        m.tick(Some(&det), Instant::now(), &mut ch);
        let st = status.lock().unwrap();
        assert_eq!(st.phase, MissionPhase::Aborted);
        assert_eq!(st.abort_reason, Some(AbortReason::External));
        assert_eq!(st.last_result.as_ref().map(|r| r.delivered), Some(true));
    }

    #[test]
    fn tick_event_carries_offset() {
        let cfg = fast_config();
        let mut m = MissionStateMachine::new(&cfg, AbortSignal::new()).unwrap();
        let mut ch = channel(Recorder::default());
        let mut det = centered(&cfg);
        det.cx += 64.0;

        let ev = m.tick(Some(&det), Instant::now(), &mut ch).event(1_700_000_000_000);
        assert_eq!(ev.kind, EventKind::PhaseChange);
        assert_eq!(ev.msg, "SEARCH -> APPROACH");
        assert_eq!(ev.quality.as_deref(), Some("CONFIDENT"));
        approx::assert_relative_eq!(ev.dx.unwrap(), 0.2, epsilon = 1e-5);
        assert_eq!(ev.command.map(|c| c.kind), Some(CommandKind::MoveRight));
    }
}
