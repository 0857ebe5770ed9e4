//! Async driver for New Scale M3-LS linear smart stages.
//!
//! Layers, bottom up:
//! - [`interface`]: one serial or PoE link to a transceiver, with the
//!   stage-select discipline for the axes multiplexed behind it.
//! - [`stage`]: one axis. Handshake, motion, status, speed and limit
//!   settings, all in micrometers.
//! - [`multistage`]: named groups of axes with concurrent dispatch and
//!   per-axis outcome reporting.
//! - [`config`]: TOML descriptions of a whole manipulator.
//!
//! Frame encoding and decoding live in [`newscale_protocol`]; this crate
//! only moves frames and interprets replies.

pub mod config;
pub mod error;
pub mod interface;
pub mod multistage;
pub mod stage;

pub use config::{ConfigError, InterfaceConfig, MultiStageConfig, TimingConfig};
pub use error::{GroupError, StageError};
pub use interface::{discover_serial_ports, Address, Interface, DEFAULT_BAUD, DEFAULT_POE_PORT};
pub use multistage::{
    open_poe_xyz, open_usb_xyz, open_xyz, AxisTarget, GroupOutcome, GroupReport, MoveKind,
    MultiStage,
};
pub use stage::{
    AxisOutcome, AxisState, ClosedLoopState, M3LinearSmartStage, StageSettings,
};

pub use newscale_protocol as protocol;
