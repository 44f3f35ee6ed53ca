use hotdrop_proto::{ChannelErrorKind, ChannelResult, Command, CommandKind};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::safety::CommandRateLimit;
use crate::{ChannelConfig, Transport};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: f32,
    pub jitter: f32,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Nominal delay after failed attempt `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let nanos = self.backoff_initial.as_nanos() as f64 * f64::from(self.backoff_factor.max(1.0)).powi(exp);
        let capped = nanos.min(self.backoff_max.as_nanos() as f64);
        Duration::from_nanos(capped.max(0.0).round() as u64)
    }

    fn backoff_jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let j = self.jitter.min(1.0);
        let scale = 1.0 + rand::thread_rng().gen_range(-j..=j);
        base.mul_f32(scale.max(0.0))
    }
}

impl From<&ChannelConfig> for RetryPolicy {
    fn from(c: &ChannelConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            backoff_initial: Duration::from_millis(c.backoff_initial_ms),
            backoff_max: Duration::from_millis(c.backoff_max_ms),
            backoff_factor: c.backoff_factor,
            jitter: c.jitter,
            timeout: Duration::from_millis(c.timeout_ms),
        }
    }
}

type Sleep = Box<dyn FnMut(Duration) + Send>;

/// Bounded retry/backoff/timeout on top of a raw transport.
pub struct CommandChannel<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    limiter: CommandRateLimit,
    sleep: Sleep,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(transport: T, cfg: &ChannelConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from(cfg),
            limiter: CommandRateLimit::new(Duration::from_millis(cfg.min_repeat_interval_ms)),
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep used between attempts.
    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + Send + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn send(&mut self, cmd: &Command) -> ChannelResult {
        if !self.limiter.allow(cmd, Instant::now()) {
            debug!("channel: {} throttled", cmd);
            return ChannelResult::throttled();
        }

        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last = None;

        while attempts < self.policy.max_attempts {
            if start.elapsed() >= self.policy.timeout {
                last = Some(ChannelErrorKind::Timeout);
                break;
            }
            attempts += 1;

            match self.transport.raw_send(cmd) {
                Ok(()) => {
                    self.limiter.record(cmd, Instant::now());
                    if attempts > 1 || cmd.kind.is_critical() {
                        info!("channel[{}]: {} delivered after {} attempt(s)", self.transport.name(), cmd, attempts);
                    } else {
                        debug!("channel[{}]: {} delivered", self.transport.name(), cmd);
                    }
                    return ChannelResult::delivered(attempts);
                }
                Err(e) => {
                    let kind = e.kind();
                    warn!("channel[{}]: {} attempt {}/{} failed: {}", self.transport.name(), cmd, attempts, self.policy.max_attempts, e);
                    last = Some(kind);

                    if !may_retry(cmd, kind) || attempts >= self.policy.max_attempts {
                        break;
                    }
                    let remaining = self.policy.timeout.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        last = Some(ChannelErrorKind::Timeout);
                        break;
                    }
                    (self.sleep)(self.policy.backoff_jittered(attempts).min(remaining));
                }
            }
        }

        let err = last.unwrap_or(ChannelErrorKind::Timeout);
        warn!("channel[{}]: giving up on {} after {} attempt(s): {:?}", self.transport.name(), cmd, attempts, err);
        ChannelResult::failed(attempts, err)
    }
}

/// DROP is not idempotent: only retry it when the transport is certain
/// nothing went out.
fn may_retry(cmd: &Command, kind: ChannelErrorKind) -> bool {
    match kind {
        ChannelErrorKind::Transient => true,
        ChannelErrorKind::Ambiguous => cmd.kind != CommandKind::Drop,
        _ => false,
    }
}
