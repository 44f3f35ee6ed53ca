pub mod command;
pub mod telemetry;

pub use command::{ChannelErrorKind, ChannelResult, Command, CommandKind, Magnitude, MissionPhase};
