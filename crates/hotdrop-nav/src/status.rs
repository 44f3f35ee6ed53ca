use hotdrop_proto::{ChannelErrorKind, ChannelResult, Command, MissionPhase};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operator abort flag, polled once per tick by the control loop.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    External,
    MissionTimeout,
    /// DROP was not confirmed delivered; the payload may or may not be gone.
    DropUnconfirmed(ChannelErrorKind),
    ChannelFailure(ChannelErrorKind),
    TooManyFailures(u32),
}

impl AbortReason {
    /// Whether a final ABORT command may still be sent to the drone.
    pub fn allows_safe_stop(&self) -> bool {
        !matches!(
            self,
            AbortReason::DropUnconfirmed(_) | AbortReason::ChannelFailure(ChannelErrorKind::Disconnected)
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::External => write!(f, "operator abort"),
            AbortReason::MissionTimeout => write!(f, "maximum mission duration elapsed"),
            AbortReason::DropUnconfirmed(k) => write!(f, "payload release unconfirmed ({:?})", k),
            AbortReason::ChannelFailure(k) => write!(f, "unrecoverable channel failure ({:?})", k),
            AbortReason::TooManyFailures(n) => write!(f, "{} consecutive undelivered commands", n),
        }
    }
}

/// Snapshot for display/logging; updated by the control loop every tick.
#[derive(Debug, Clone)]
pub struct MissionStatus {
    pub phase: MissionPhase,
    pub ticks: u64,
    pub last_command: Option<Command>,
    pub last_result: Option<ChannelResult>,
    pub abort_reason: Option<AbortReason>,
}

impl Default for MissionStatus {
    fn default() -> Self {
        Self {
            phase: MissionPhase::Search,
            ticks: 0,
            last_command: None,
            last_result: None,
            abort_reason: None,
        }
    }
}
