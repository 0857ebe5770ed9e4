//! Command codec for New Scale M3 linear smart stages.
//!
//! Protocol: ASCII command/response frames over a half-duplex link.
//! Commands are wrapped in angle brackets and terminated with CR, e.g.
//! `<08 00001388>\r` (move to target). Hub ("transceiver") commands carry
//! a `TR` prefix, e.g. `TR<A0 01>\r` (select stage 01).
//! Reference: M3-LS / M3-L command and control reference, firmware r4.
//!
//! This crate is pure encode/decode: no I/O, no async. It is the single
//! place where the device's fixed-point position scale and register
//! conversion constants live; the driver crate talks to hardware and works
//! exclusively in micrometers.

pub mod command;
pub mod error;
pub mod frame;
pub mod status;
pub mod units;

pub use command::{BaudRate, Direction, DriveMode, StageCmd, TransceiverCmd};
pub use error::ProtocolError;
pub use frame::{StageCommand, StageReply, TransceiverCommand, TransceiverReply, TERMINATOR};
pub use status::{MotionMode, StateBit, StatusWord};
pub use units::{ticks_to_um, um_to_ticks, ClosedLoopSpeed, SpeedRegisters, TICKS_PER_UM};
