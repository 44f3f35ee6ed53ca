use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use hotdrop_fc::servo::{angle_in_range, ServoConfig, ServoTransport};
use hotdrop_fc::{open_transport, ChannelConfig, CommandChannel, Transport, TransportConfig};
use hotdrop_nav::doctor::{check_channel, check_control};
use hotdrop_nav::{AbortSignal, ControlConfig, MapperConfig, MissionConfig, MissionStateMachine, MissionStatus};
use hotdrop_proto::telemetry::{EventKind, MissionEvent};
use hotdrop_proto::MissionPhase;
use hotdrop_vision::replay::ReplayDetector;
use hotdrop_vision::{Detector, FilterConfig, Frame, FrameDims};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Parser)]
#[command(name = "hotdrop", version, about = "hotdrop - vision-guided payload drop controller")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config and transport settings.
    Doctor,
    /// Fly one mission from a detection source.
    Run {
        /// JSON-lines detection replay; overrides detector.replay.
        #[arg(long)]
        replay: Option<String>,
        /// Write one JSON mission event per tick to this file.
        #[arg(long)]
        events: Option<String>,
    },
    /// Send raw angles to the servo rig.
    Servo { a1: i32, a2: i32 },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    frame: FrameDims,
    filter: FilterConfig,
    mapper: MapperConfig,
    mission: MissionConfig,
    channel: ChannelConfig,
    transport: TransportConfig,
    detector: DetectorCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct DetectorCfg {
    /// Only "replay" ships; live detectors plug in through the Detector trait.
    kind: String,
    replay: Option<String>,
    /// Pause between replayed frames. 0 = as fast as possible.
    frame_interval_ms: u64,
}

impl Default for DetectorCfg {
    fn default() -> Self {
        Self { kind: "replay".into(), replay: None, frame_interval_ms: 0 }
    }
}

impl Config {
    fn control(&self) -> ControlConfig {
        ControlConfig {
            frame: self.frame,
            filter: self.filter.clone(),
            mapper: self.mapper.clone(),
            mission: self.mission.clone(),
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { replay, events } => run(cfg, replay, events).await?,
        Command::Servo { a1, a2 } => servo(&cfg, a1, a2)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    check_control(&cfg.control())?;
    check_channel(&cfg.channel)?;

    match cfg.transport.kind.as_str() {
        "servo" => {
            let sc = cfg.transport.servo.clone().unwrap_or_default();
            anyhow::ensure!(!sc.serial_dev.is_empty(), "transport.servo.serial_dev missing");
            anyhow::ensure!(sc.baud > 0, "transport.servo.baud invalid");
            check_servo_angles(&sc)?;
        }
        "mavlink" => {
            let mc = cfg.transport.mavlink.clone().unwrap_or_default();
            anyhow::ensure!(mc.url.is_some() || !mc.serial_dev.is_empty(), "transport.mavlink needs url or serial_dev");
            anyhow::ensure!((1000..=2000).contains(&mc.drop_servo_pwm), "transport.mavlink.drop_servo_pwm outside 1000..=2000");
            anyhow::ensure!(mc.speed_small > 0.0 && mc.speed_small <= mc.speed_medium && mc.speed_medium <= mc.speed_large, "transport.mavlink speeds must be positive and ordered");
        }
        "sim" => {
            let rate = cfg.transport.sim.as_ref().map(|s| s.failure_rate).unwrap_or(0.0);
            anyhow::ensure!((0.0..=1.0).contains(&rate), "transport.sim.failure_rate outside 0..=1");
        }
        other => anyhow::bail!("unknown transport.kind: {}", other),
    }

    anyhow::ensure!(cfg.detector.kind == "replay", "unknown detector.kind: {}", cfg.detector.kind);
    if let Some(p) = &cfg.detector.replay {
        anyhow::ensure!(Path::new(p).exists(), "detector.replay not found: {}", p);
    } else {
        warn!("doctor: no detector.replay set; `run` will need --replay");
    }

    info!("doctor: OK");
    Ok(())
}

fn check_servo_angles(sc: &ServoConfig) -> Result<()> {
    let [n1, n2] = sc.neutral;
    let step = sc.step_small.max(sc.step_medium).max(sc.step_large);
    for (name, a) in [
        ("neutral", n1),
        ("neutral", n2),
        ("release", sc.release[0]),
        ("release", sc.release[1]),
        ("safe", sc.safe[0]),
        ("safe", sc.safe[1]),
        ("neutral - step", n1.min(n2) - step),
        ("neutral + step", n1.max(n2) + step),
    ] {
        anyhow::ensure!(angle_in_range(a), "transport.servo {} angle {} outside 0..=180", name, a);
    }
    Ok(())
}

fn servo(cfg: &Config, a1: i32, a2: i32) -> Result<()> {
    anyhow::ensure!(angle_in_range(a1) && angle_in_range(a2), "angles must be within 0..=180");
    let sc = cfg.transport.servo.clone().unwrap_or_default();
    let dev = sc.serial_dev.clone();
    let mut port = ServoTransport::open_serial(sc).context("servo open")?;
    port.send_angles(a1, a2)?;
    info!("servo: sent {},{} to {}", a1, a2, dev);
    Ok(())
}

async fn run(cfg: Config, replay: Option<String>, events: Option<String>) -> Result<()> {
    info!("run: starting");

    let control = cfg.control();
    check_channel(&cfg.channel)?;
    let abort = AbortSignal::new();
    let mut machine = MissionStateMachine::new(&control, abort.clone()).context("control config")?;
    let status = machine.status_handle();

    let path = replay
        .or_else(|| cfg.detector.replay.clone())
        .context("no detection source: pass --replay or set detector.replay")?;
    let mut det = ReplayDetector::open(&path, control.frame)?;

    let transport = open_transport(&cfg.transport).context("transport open")?;
    info!("run: transport {} ready", transport.name());
    let mut channel = CommandChannel::new(transport, &cfg.channel);

    let mut sink = match events {
        Some(p) => Some(BufWriter::new(File::create(&p).with_context(|| format!("create events file {}", p))?)),
        None => None,
    };

    let ctrl_c = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("run: ctrl-c, aborting mission");
            ctrl_c.trigger();
        }
    });

    let interval = Duration::from_millis(cfg.detector.frame_interval_ms);

    // Serial/MAVLink writes block; keep the control loop off the async workers.
    let control_loop = tokio::task::spawn_blocking(move || -> Result<()> {
        while !machine.phase().is_terminal() {
            let frame = match det.next_frame()? {
                Some(f) => f,
                None => {
                    warn!("run: detection source exhausted in {}", machine.phase());
                    abort.trigger();
                    Frame::default()
                }
            };
            let out = machine.tick(frame.target().as_ref(), Instant::now(), &mut channel);
            if let Some(w) = sink.as_mut() {
                write_event(w, &out.event(now_unix_ms()))?;
            }
            if !interval.is_zero() {
                std::thread::sleep(interval);
            }
        }

        if let Some(res) = machine.safe_stop(&mut channel) {
            if let Some(w) = sink.as_mut() {
                let mut ev = MissionEvent::new(now_unix_ms(), machine.ticks(), EventKind::Abort, machine.phase(), "safe stop");
                ev.result = Some(res);
                write_event(w, &ev)?;
            }
        }
        if let Some(w) = sink.as_mut() {
            w.flush().context("flush events")?;
        }
        Ok(())
    });
    control_loop.await.context("control loop panicked")??;

    let st = match status.lock() {
        Ok(s) => s.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    report(&st)
}

fn write_event(w: &mut impl Write, ev: &MissionEvent) -> Result<()> {
    serde_json::to_writer(&mut *w, ev).context("encode event")?;
    w.write_all(b"\n").context("write event")?;
    Ok(())
}

fn report(st: &MissionStatus) -> Result<()> {
    info!("run: finished in {} after {} ticks", st.phase, st.ticks);
    if let Some(r) = &st.last_result {
        info!("run: last command {:?} delivered={} attempts={}", st.last_command.map(|c| c.kind), r.delivered, r.attempts);
    }
    match (st.phase, st.abort_reason) {
        (MissionPhase::Done, _) => Ok(()),
        (_, Some(reason)) => anyhow::bail!("mission aborted: {}", reason),
        (phase, None) => anyhow::bail!("mission stopped in {}", phase),
    }
}
