//! Opcode tables and small wire enums shared by the encoder and decoder.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage command opcodes. Every command echoes its opcode back in the
/// reply, so some opcodes are only ever seen in the receive direction
/// (notably the two illegal-command rejections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageCmd {
    /// Dual purpose: also establishes host control on first issue.
    FirmwareVersion,
    ReleaseHostControl,
    Halt,
    /// Run the motor for a fixed time, or open-ended if no duration given.
    Run,
    /// Step a fixed distance in closed-loop mode.
    StepClosedLoop,
    ClearEncoderCount,
    /// Move to an absolute setpoint (closed-loop mode required).
    MoveToTarget,
    OpenLoopSpeed,
    ClosedLoopState,
    MotorStatus,
    DriveMode,
    IllegalCommandFormat,
    IllegalCommand,
    ClosedLoopSpeed,
    SoftLimitValues,
    SoftLimitStates,
    TimeIntervalUnits,
    BaudRate,
}

impl StageCmd {
    pub fn opcode(self) -> &'static str {
        match self {
            Self::FirmwareVersion => "01",
            Self::ReleaseHostControl => "02",
            Self::Halt => "03",
            Self::Run => "04",
            Self::StepClosedLoop => "06",
            Self::ClearEncoderCount => "07",
            Self::MoveToTarget => "08",
            Self::OpenLoopSpeed => "09",
            Self::ClosedLoopState => "10",
            Self::MotorStatus => "19",
            Self::DriveMode => "20",
            Self::IllegalCommandFormat => "23",
            Self::IllegalCommand => "24",
            Self::ClosedLoopSpeed => "40",
            Self::SoftLimitValues => "46",
            Self::SoftLimitStates => "47",
            Self::TimeIntervalUnits => "52",
            Self::BaudRate => "54",
        }
    }

    pub fn from_opcode(opcode: &str) -> Option<Self> {
        Some(match opcode {
            "01" => Self::FirmwareVersion,
            "02" => Self::ReleaseHostControl,
            "03" => Self::Halt,
            "04" => Self::Run,
            "06" => Self::StepClosedLoop,
            "07" => Self::ClearEncoderCount,
            "08" => Self::MoveToTarget,
            "09" => Self::OpenLoopSpeed,
            "10" => Self::ClosedLoopState,
            "19" => Self::MotorStatus,
            "20" => Self::DriveMode,
            "23" => Self::IllegalCommandFormat,
            "24" => Self::IllegalCommand,
            "40" => Self::ClosedLoopSpeed,
            "46" => Self::SoftLimitValues,
            "47" => Self::SoftLimitStates,
            "52" => Self::TimeIntervalUnits,
            "54" => Self::BaudRate,
            _ => return None,
        })
    }
}

impl fmt::Display for StageCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.opcode())
    }
}

/// Transceiver (hub) command opcodes, for M3-USB-3:1-EP and M3-PoE-3:1
/// interface boxes. Issued with the `TR` prefix: `TR<A0 01>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransceiverCmd {
    FirmwareVersion,
    BaudRate,
    StageSelect,
    MacAddress,
}

impl TransceiverCmd {
    pub fn opcode(self) -> &'static str {
        match self {
            Self::FirmwareVersion => "01",
            Self::BaudRate => "54",
            Self::StageSelect => "A0",
            Self::MacAddress => "A2",
        }
    }

    pub fn from_opcode(opcode: &str) -> Option<Self> {
        Some(match opcode {
            "01" => Self::FirmwareVersion,
            "54" => Self::BaudRate,
            "A0" => Self::StageSelect,
            "A2" => Self::MacAddress,
            _ => return None,
        })
    }
}

impl fmt::Display for TransceiverCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TR<{}>", self.opcode())
    }
}

/// Travel direction as it appears in run/step command arguments.
///
/// `Neither` is only valid when saving a step size without stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Backward,
    Forward,
    Neither,
}

impl Direction {
    pub(crate) fn arg(self) -> &'static str {
        match self {
            Self::Backward => "0",
            Self::Forward => "1",
            Self::Neither => "N",
        }
    }

    /// Direction of a signed travel amount (non-negative is forward).
    pub fn of(amount_um: f64) -> Self {
        if amount_um >= 0.0 {
            Self::Forward
        } else {
            Self::Backward
        }
    }
}

/// Open- versus closed-loop drive mode. Absolute moves require
/// closed-loop mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveMode {
    OpenLoop,
    ClosedLoop,
}

impl DriveMode {
    pub(crate) fn arg(self) -> &'static str {
        match self {
            Self::OpenLoop => "0",
            Self::ClosedLoop => "1",
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::OpenLoop),
            1 => Some(Self::ClosedLoop),
            _ => None,
        }
    }
}

/// UART baud rates the stage firmware supports, with their wire codes.
/// Baud changes take effect on the next power cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    B19200,
    B38400,
    B57600,
    B115200,
    B250000,
}

impl BaudRate {
    pub fn code(self) -> u8 {
        match self {
            Self::B19200 => 0x00,
            Self::B38400 => 0x01,
            Self::B57600 => 0x02,
            Self::B115200 => 0x03,
            Self::B250000 => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::B19200,
            0x01 => Self::B38400,
            0x02 => Self::B57600,
            0x03 => Self::B115200,
            0x04 => Self::B250000,
            _ => return None,
        })
    }

    pub fn bps(self) -> u32 {
        match self {
            Self::B19200 => 19_200,
            Self::B38400 => 38_400,
            Self::B57600 => 57_600,
            Self::B115200 => 115_200,
            Self::B250000 => 250_000,
        }
    }

    pub fn from_bps(bps: u32) -> Option<Self> {
        Some(match bps {
            19_200 => Self::B19200,
            38_400 => Self::B38400,
            57_600 => Self::B57600,
            115_200 => Self::B115200,
            250_000 => Self::B250000,
            _ => return None,
        })
    }
}
