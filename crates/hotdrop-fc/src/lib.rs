pub mod channel;
pub mod mav;
pub mod safety;
pub mod servo;
pub mod sim;

use hotdrop_proto::{ChannelErrorKind, Command};
use serde::Deserialize;

pub use channel::{CommandChannel, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Nothing left this side of the link; safe to send again.
    #[error("not sent: {0}")]
    NotSent(String),
    /// Bytes may have reached the drone but delivery was not confirmed.
    #[error("delivery unconfirmed: {0}")]
    Ambiguous(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("link down: {0}")]
    Disconnected(String),
}

impl TransportError {
    pub fn kind(&self) -> ChannelErrorKind {
        match self {
            TransportError::NotSent(_) => ChannelErrorKind::Transient,
            TransportError::Ambiguous(_) => ChannelErrorKind::Ambiguous,
            TransportError::Rejected(_) => ChannelErrorKind::Rejected,
            TransportError::Disconnected(_) => ChannelErrorKind::Disconnected,
        }
    }
}

/// Raw single-shot delivery of one command. No retry.
pub trait Transport: Send {
    fn name(&self) -> &str;
    fn raw_send(&mut self, cmd: &Command) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn raw_send(&mut self, cmd: &Command) -> Result<(), TransportError> {
        (**self).raw_send(cmd)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f32,
    /// Random spread applied to each backoff, as a fraction (0.2 = +/-20%).
    pub jitter: f32,
    /// Hard bound on one `send`, retries and backoff included.
    pub timeout_ms: u64,
    /// Identical movement/HOLD commands inside this window are not re-sent. 0 disables.
    pub min_repeat_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_ms: 20,
            backoff_max_ms: 200,
            backoff_factor: 2.0,
            jitter: 0.0,
            timeout_ms: 500,
            min_repeat_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// "servo" | "mavlink" | "sim"
    pub kind: String,
    pub servo: Option<servo::ServoConfig>,
    pub mavlink: Option<mav::MavConfig>,
    pub sim: Option<sim::SimConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { kind: "sim".into(), servo: None, mavlink: None, sim: None }
    }
}

/// Opens the transport selected by `cfg.kind`.
pub fn open_transport(cfg: &TransportConfig) -> anyhow::Result<Box<dyn Transport>> {
    match cfg.kind.as_str() {
        "servo" => {
            let sc = cfg.servo.clone().unwrap_or_default();
            Ok(Box::new(servo::ServoTransport::open_serial(sc)?))
        }
        "mavlink" => {
            let mc = cfg.mavlink.clone().unwrap_or_default();
            Ok(Box::new(mav::MavlinkTransport::open(mc)?))
        }
        "sim" => {
            let sc = cfg.sim.clone().unwrap_or_default();
            Ok(Box::new(sim::SimTransport::new(sc)))
        }
        other => anyhow::bail!("unknown transport.kind: {}", other),
    }
}
