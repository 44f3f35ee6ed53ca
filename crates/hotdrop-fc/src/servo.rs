use anyhow::{Context, Result};
use bytes::Bytes;
use hotdrop_proto::{Command, CommandKind, Magnitude};
use serde::Deserialize;
use std::io::{self, Write};
use std::time::Duration;
use tracing::{debug, info};

use crate::{Transport, TransportError};

pub const ANGLE_MIN: i32 = 0;
pub const ANGLE_MAX: i32 = 180;

/// Two-servo rig driven by an Arduino reading `"a1,a2\n"` lines.
/// Servo 1 pans (left/right), servo 2 tilts (up/down).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub serial_dev: String,
    pub baud: u32,
    /// The board resets when the port opens; wait before the first write.
    pub settle_ms: u64,
    pub write_timeout_ms: u64,
    pub neutral: [i32; 2],
    pub release: [i32; 2],
    pub safe: [i32; 2],
    pub step_small: i32,
    pub step_medium: i32,
    pub step_large: i32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            serial_dev: "/dev/ttyUSB0".into(),
            baud: 9600,
            settle_ms: 2000,
            write_timeout_ms: 1000,
            neutral: [90, 90],
            release: [0, 0],
            safe: [180, 180],
            step_small: 10,
            step_medium: 25,
            step_large: 45,
        }
    }
}

impl ServoConfig {
    pub fn angles_for(&self, cmd: &Command) -> (i32, i32) {
        let [n1, n2] = self.neutral;
        let step = match cmd.magnitude {
            Some(Magnitude::Small) | None => self.step_small,
            Some(Magnitude::Medium) => self.step_medium,
            Some(Magnitude::Large) => self.step_large,
        };
        match cmd.kind {
            CommandKind::Hold => (n1, n2),
            CommandKind::Drop => (self.release[0], self.release[1]),
            CommandKind::Abort => (self.safe[0], self.safe[1]),
            CommandKind::MoveLeft => (n1 - step, n2),
            CommandKind::MoveRight => (n1 + step, n2),
            CommandKind::MoveUp => (n1, n2 - step),
            CommandKind::MoveDown => (n1, n2 + step),
            // no servo axis for range
            CommandKind::MoveForward | CommandKind::MoveBack => (n1, n2),
        }
    }
}

pub fn encode_angles(a1: i32, a2: i32) -> Bytes {
    Bytes::from(format!("{},{}\n", a1, a2))
}

pub fn angle_in_range(a: i32) -> bool {
    (ANGLE_MIN..=ANGLE_MAX).contains(&a)
}

pub struct ServoTransport<W: Write + Send> {
    port: W,
    cfg: ServoConfig,
}

impl ServoTransport<Box<dyn tokio_serial::SerialPort>> {
    pub fn open_serial(cfg: ServoConfig) -> Result<Self> {
        let port = tokio_serial::new(&cfg.serial_dev, cfg.baud)
            .timeout(Duration::from_millis(cfg.write_timeout_ms))
            .open()
            .with_context(|| format!("open servo serial device {} @ {}", cfg.serial_dev, cfg.baud))?;
        info!("servo: opened {} @ {} baud, settling {}ms", cfg.serial_dev, cfg.baud, cfg.settle_ms);
        std::thread::sleep(Duration::from_millis(cfg.settle_ms));
        Ok(Self::new(port, cfg))
    }
}

impl<W: Write + Send> ServoTransport<W> {
    pub fn new(port: W, cfg: ServoConfig) -> Self {
        Self { port, cfg }
    }

    pub fn port(&self) -> &W {
        &self.port
    }

    pub fn send_angles(&mut self, a1: i32, a2: i32) -> Result<(), TransportError> {
        if !angle_in_range(a1) || !angle_in_range(a2) {
            return Err(TransportError::Rejected(format!(
                "angles must be between {} and {} degrees, got {},{}",
                ANGLE_MIN, ANGLE_MAX, a1, a2
            )));
        }
        let frame = encode_angles(a1, a2);
        self.port.write_all(&frame).map_err(|e| write_error(e, TransportError::NotSent))?;
        self.port.flush().map_err(|e| write_error(e, TransportError::Ambiguous))?;
        debug!("servo: sent {}", String::from_utf8_lossy(&frame).trim_end());
        Ok(())
    }
}

fn write_error(e: io::Error, otherwise: fn(String) -> TransportError) -> TransportError {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => TransportError::Disconnected(e.to_string()),
        _ => otherwise(e.to_string()),
    }
}

impl<W: Write + Send> Transport for ServoTransport<W> {
    fn name(&self) -> &str {
        "servo"
    }

    fn raw_send(&mut self, cmd: &Command) -> Result<(), TransportError> {
        if matches!(cmd.kind, CommandKind::MoveForward | CommandKind::MoveBack) {
            debug!("servo: {} has no servo axis, holding neutral", cmd.kind);
        }
        let (a1, a2) = self.cfg.angles_for(cmd);
        self.send_angles(a1, a2)
    }
}
