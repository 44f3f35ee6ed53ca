use anyhow::{Context, Result};
use hotdrop_proto::{Command, CommandKind, Magnitude};
use mavlink::{
    common::{
        MavCmd, MavFrame, MavMessage, MavResult, PositionTargetTypemask, COMMAND_LONG_DATA,
        SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader,
};
use serde::Deserialize;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{Transport, TransportError};

/// Velocity-only setpoint: ignore position, acceleration, yaw and yaw rate.
const TYPEMASK_VELOCITY_ONLY: u16 = 0b0000_1101_1100_0111;

/// Consecutive hard read errors after which the reader gives up on the link.
const MAX_READ_ERRORS: u32 = 20;

type MavConn = Arc<dyn MavConnection<MavMessage> + Sync + Send>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MavConfig {
    /// Full mavlink connection string (e.g. "udpout:127.0.0.1:14550" for SITL).
    /// When unset, `serial:<serial_dev>:<baud>` is used.
    pub url: Option<String>,
    pub serial_dev: String,
    pub baud: u32,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Body-frame speed per tier, m/s.
    pub speed_small: f32,
    pub speed_medium: f32,
    pub speed_large: f32,

    /// Release is a servo output on the FC.
    pub drop_servo_channel: u8,
    pub drop_servo_pwm: u16,

    /// Require seeing FC heartbeat before sending commands
    pub require_heartbeat: bool,
    /// Wait for COMMAND_ACK after COMMAND_LONG (DROP, ABORT).
    pub require_ack: bool,
    pub ack_timeout_ms: u64,
}

impl Default for MavConfig {
    fn default() -> Self {
        Self {
            url: None,
            serial_dev: "/dev/ttyACM0".into(),
            baud: 57600,
            sys_id: 1,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            speed_small: 0.2,
            speed_medium: 0.5,
            speed_large: 1.0,
            drop_servo_channel: 9,
            drop_servo_pwm: 1900,
            require_heartbeat: true,
            require_ack: true,
            ack_timeout_ms: 300,
        }
    }
}

impl MavConfig {
    pub fn connection_url(&self) -> String {
        self.url.clone().unwrap_or_else(|| format!("serial:{}:{}", self.serial_dev, self.baud))
    }

    fn speed(&self, m: Option<Magnitude>) -> f32 {
        match m {
            Some(Magnitude::Small) | None => self.speed_small,
            Some(Magnitude::Medium) => self.speed_medium,
            Some(Magnitude::Large) => self.speed_large,
        }
    }

    /// Body NED velocity (forward, right, down) for movement and HOLD.
    pub fn body_velocity(&self, cmd: &Command) -> Option<(f32, f32, f32)> {
        let v = self.speed(cmd.magnitude);
        match cmd.kind {
            CommandKind::Hold => Some((0.0, 0.0, 0.0)),
            CommandKind::MoveForward => Some((v, 0.0, 0.0)),
            CommandKind::MoveBack => Some((-v, 0.0, 0.0)),
            CommandKind::MoveRight => Some((0.0, v, 0.0)),
            CommandKind::MoveLeft => Some((0.0, -v, 0.0)),
            CommandKind::MoveDown => Some((0.0, 0.0, v)),
            CommandKind::MoveUp => Some((0.0, 0.0, -v)),
            CommandKind::Drop | CommandKind::Abort => None,
        }
    }
}

pub struct MavlinkTransport {
    conn: MavConn,
    inbox: Receiver<MavMessage>,
    hdr: MavHeader,
    cfg: MavConfig,
    seen_heartbeat: bool,
    started: Instant,
}

impl MavlinkTransport {
    pub fn open(cfg: MavConfig) -> Result<Self> {
        let url = cfg.connection_url();
        let conn = mavlink::connect::<MavMessage>(&url)
            .with_context(|| format!("mavlink connect {}", url))?;
        info!("mavlink: connected {}", url);
        Self::with_connection(Arc::from(conn), cfg)
    }

    /// Takes over an open connection. `recv` blocks on serial and UDP links, so
    /// incoming traffic is read on a dedicated thread and handed over via `inbox`.
    pub fn with_connection(conn: Arc<dyn MavConnection<MavMessage> + Sync + Send>, cfg: MavConfig) -> Result<Self> {
        let (tx, inbox) = mpsc::channel();
        let reader = Arc::clone(&conn);
        thread::Builder::new()
            .name("mavlink-reader".into())
            .spawn(move || read_loop(reader, tx))
            .context("spawn mavlink reader")?;

        Ok(Self {
            conn,
            inbox,
            hdr: MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 },
            cfg,
            seen_heartbeat: false,
            started: Instant::now(),
        })
    }

    fn send(&mut self, msg: MavMessage) -> Result<(), TransportError> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.conn
            .send(&self.hdr, &msg)
            .map(|_| ())
            .map_err(|e| TransportError::NotSent(format!("mavlink send: {}", e)))
    }

    fn note(&mut self, msg: &MavMessage) {
        if matches!(msg, MavMessage::HEARTBEAT(_)) {
            self.seen_heartbeat = true;
        }
    }

    /// Discards traffic that arrived since the last command so a late ACK is
    /// never taken for the next one.
    fn drain_inbox(&mut self) -> Result<(), TransportError> {
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => self.note(&msg),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(reader_gone()),
            }
        }
    }

    /// Waits for a message accepted by `done`. `Ok(None)` once `timeout` passes.
    fn recv_until<F>(&mut self, timeout: Duration, mut done: F) -> Result<Option<MavMessage>, TransportError>
    where
        F: FnMut(&MavMessage) -> bool,
    {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.inbox.recv_timeout(remaining) {
                Ok(msg) => {
                    self.note(&msg);
                    if done(&msg) {
                        return Ok(Some(msg));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(reader_gone()),
            }
        }
    }

    fn ensure_heartbeat(&mut self) -> Result<(), TransportError> {
        if !self.cfg.require_heartbeat || self.seen_heartbeat {
            return Ok(());
        }
        let wait = Duration::from_millis(self.cfg.ack_timeout_ms);
        if self.recv_until(wait, |m| matches!(m, MavMessage::HEARTBEAT(_)))?.is_none() {
            return Err(TransportError::NotSent("refusing command: no heartbeat seen yet".into()));
        }
        Ok(())
    }

    fn set_velocity(&mut self, vx: f32, vy: f32, vz: f32) -> Result<(), TransportError> {
        let sp = SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.started.elapsed().as_millis() as u32,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx,
            vy,
            vz,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            type_mask: PositionTargetTypemask::from_bits_truncate(TYPEMASK_VELOCITY_ONLY),
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_BODY_NED,
        };
        self.send(MavMessage::SET_POSITION_TARGET_LOCAL_NED(sp))
    }

    fn command_long(&mut self, command: MavCmd, param1: f32, param2: f32) -> Result<(), TransportError> {
        let cmd = COMMAND_LONG_DATA {
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            command,
            confirmation: 0,
            param1,
            param2,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        };
        self.send(MavMessage::COMMAND_LONG(cmd))?;

        if !self.cfg.require_ack {
            return Ok(());
        }
        let wait = Duration::from_millis(self.cfg.ack_timeout_ms);
        match self.recv_until(wait, |m| matches!(m, MavMessage::COMMAND_ACK(a) if a.command == command))? {
            Some(MavMessage::COMMAND_ACK(ack)) if ack.result == MavResult::MAV_RESULT_ACCEPTED => Ok(()),
            Some(MavMessage::COMMAND_ACK(ack)) => {
                Err(TransportError::Rejected(format!("{:?} answered {:?}", command, ack.result)))
            }
            _ => Err(TransportError::Ambiguous(format!("no COMMAND_ACK for {:?} within {:?}", command, wait))),
        }
    }
}

fn reader_gone() -> TransportError {
    TransportError::Disconnected("mavlink reader stopped".into())
}

/// Timeouts and would-block reads just mean nothing arrived.
fn is_quiet(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted)
}

/// Forwards every decoded message to `tx`. Returns when the transport is gone
/// or after `MAX_READ_ERRORS` hard I/O errors in a row; dropping `tx` then
/// surfaces as `Disconnected` on the next wait.
fn read_loop(conn: MavConn, tx: Sender<MavMessage>) {
    let mut errors = 0u32;
    loop {
        match conn.recv() {
            Ok((_hdr, msg)) => {
                errors = 0;
                if tx.send(msg).is_err() {
                    return;
                }
            }
            Err(MessageReadError::Io(e)) if is_quiet(&e) => thread::sleep(Duration::from_millis(5)),
            Err(MessageReadError::Io(e)) => {
                errors += 1;
                debug!("mavlink: read error {}/{}: {}", errors, MAX_READ_ERRORS, e);
                if errors >= MAX_READ_ERRORS {
                    warn!("mavlink: giving up on link after {} read errors: {}", errors, e);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => debug!("mavlink: skipping frame: {}", e),
        }
    }
}

impl Transport for MavlinkTransport {
    fn name(&self) -> &str {
        "mavlink"
    }

    fn raw_send(&mut self, cmd: &Command) -> Result<(), TransportError> {
        self.drain_inbox()?;
        self.ensure_heartbeat()?;

        match cmd.kind {
            CommandKind::Drop => {
                info!("FC: release servo {} -> {}", self.cfg.drop_servo_channel, self.cfg.drop_servo_pwm);
                self.command_long(
                    MavCmd::MAV_CMD_DO_SET_SERVO,
                    f32::from(self.cfg.drop_servo_channel),
                    f32::from(self.cfg.drop_servo_pwm),
                )
            }
            CommandKind::Abort => {
                warn!("FC: sending HOLD/LOITER (abort)");
                self.command_long(MavCmd::MAV_CMD_NAV_LOITER_UNLIM, 0.0, 0.0)
            }
            _ => {
                let (vx, vy, vz) = self.cfg.body_velocity(cmd).unwrap_or((0.0, 0.0, 0.0));
                debug!("FC: {} -> v=({:.2}, {:.2}, {:.2})", cmd, vx, vy, vz);
                self.set_velocity(vx, vy, vz)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelConfig, CommandChannel};
    use hotdrop_proto::ChannelErrorKind;
    use mavlink::error::MessageWriteError;
    use mavlink::MavlinkVersion;
    use std::sync::Mutex;

    /// Link that accepts every write and never answers. `dead` makes every
    /// read fail like an unplugged serial adapter.
    #[derive(Default)]
    struct Silent {
        dead: bool,
        written: Mutex<Vec<MavMessage>>,
    }

    impl MavConnection<MavMessage> for Silent {
        fn recv(&self) -> Result<(MavHeader, MavMessage), MessageReadError> {
            if self.dead {
                return Err(MessageReadError::Io(io::ErrorKind::BrokenPipe.into()));
            }
            loop {
                thread::park();
            }
        }

        fn send(&self, _hdr: &MavHeader, msg: &MavMessage) -> Result<usize, MessageWriteError> {
            self.written.lock().unwrap().push(msg.clone());
            Ok(0)
        }

        fn set_protocol_version(&mut self, _v: MavlinkVersion) {}

        fn get_protocol_version(&self) -> MavlinkVersion {
            MavlinkVersion::V2
        }
    }

    fn no_heartbeat(ack_timeout_ms: u64) -> MavConfig {
        MavConfig { require_heartbeat: false, require_ack: true, ack_timeout_ms, ..Default::default() }
    }

    #[test]
    fn unanswered_release_is_ambiguous_after_ack_timeout() {
        let link = Arc::new(Silent::default());
        let mut t = MavlinkTransport::with_connection(link.clone(), no_heartbeat(100)).unwrap();

        let start = Instant::now();
        let err = t.raw_send(&Command::drop_payload(1)).unwrap_err();
        assert!(matches!(err, TransportError::Ambiguous(_)), "{}", err);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(link.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn channel_timeout_holds_on_a_quiet_link() {
        let link = Arc::new(Silent::default());
        let t = MavlinkTransport::with_connection(link.clone(), no_heartbeat(100)).unwrap();
        let mut ch = CommandChannel::new(t, &ChannelConfig { timeout_ms: 300, ..Default::default() });

        let start = Instant::now();
        let r = ch.send(&Command::drop_payload(1));
        assert!(!r.delivered);
        assert_eq!(r.last_error, Some(ChannelErrorKind::Ambiguous));
        // an unconfirmed release is never sent twice
        assert_eq!(r.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn quiet_link_refuses_without_heartbeat() {
        let link = Arc::new(Silent::default());
        let cfg = MavConfig { require_heartbeat: true, ack_timeout_ms: 50, ..Default::default() };
        let mut t = MavlinkTransport::with_connection(link.clone(), cfg).unwrap();

        let err = t.raw_send(&Command::hold(1)).unwrap_err();
        assert!(matches!(err, TransportError::NotSent(_)), "{}", err);
        assert!(link.written.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_reads_report_link_down() {
        let link = Arc::new(Silent { dead: true, ..Default::default() });
        let mut t = MavlinkTransport::with_connection(link.clone(), no_heartbeat(5_000)).unwrap();

        let start = Instant::now();
        let err = t.raw_send(&Command::drop_payload(1)).unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(3));

        // nothing more goes out once the reader is gone
        let before = link.written.lock().unwrap().len();
        let err = t.raw_send(&Command::hold(2)).unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)), "{}", err);
        assert_eq!(link.written.lock().unwrap().len(), before);
    }

    #[test]
    fn velocity_follows_body_ned() {
        let cfg = MavConfig::default();
        let right = Command::movement(CommandKind::MoveRight, Magnitude::Large, 0.8, 1);
        assert_eq!(cfg.body_velocity(&right), Some((0.0, 1.0, 0.0)));

        let up = Command::movement(CommandKind::MoveUp, Magnitude::Small, 0.1, 2);
        assert_eq!(cfg.body_velocity(&up), Some((0.0, 0.0, -0.2)));

        let back = Command::movement(CommandKind::MoveBack, Magnitude::Medium, 0.3, 3);
        assert_eq!(cfg.body_velocity(&back), Some((-0.5, 0.0, 0.0)));

        assert_eq!(cfg.body_velocity(&Command::hold(4)), Some((0.0, 0.0, 0.0)));
        assert_eq!(cfg.body_velocity(&Command::drop_payload(5)), None);
    }

    #[test]
    fn connection_url_defaults_to_serial() {
        let cfg = MavConfig::default();
        assert_eq!(cfg.connection_url(), "serial:/dev/ttyACM0:57600");
        let sitl = MavConfig { url: Some("udpout:127.0.0.1:14550".into()), ..Default::default() };
        assert_eq!(sitl.connection_url(), "udpout:127.0.0.1:14550");
    }
}
