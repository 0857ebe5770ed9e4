//! Frame encoding and decoding.
//!
//! Commands encode to `<OP[ ARG…]>\r` with fixed-width upper-case hex
//! arguments. Replies echo the opcode and carry zero or more hex fields
//! whose widths are command-specific and not C-sized (24-bit unsigned
//! status, 32-bit two's-complement positions, single-nibble flags).
//! Structural validation happens before any field is interpreted.

use crate::command::{BaudRate, Direction, DriveMode, StageCmd, TransceiverCmd};
use crate::error::ProtocolError;
use crate::status::StatusWord;
use crate::units::{um_to_ticks, SpeedRegisters};

/// Every frame in both directions ends with a carriage return.
pub const TERMINATOR: u8 = b'\r';

/// Prefix distinguishing transceiver (hub) frames from stage frames.
const TR_PREFIX: &str = "TR";

// =============================================================================
// Stage commands (encode)
// =============================================================================

/// One fully-specified stage command. Immutable once constructed; the
/// physical-unit constructors do all range checking and tick conversion
/// so an instance always encodes to a valid frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StageCommand {
    /// Also establishes host control on first issue after power-up.
    FirmwareVersion,
    ReleaseHostControl,
    Halt,
    Run {
        direction: Direction,
        /// Run duration in tenths of a second; open-ended when absent.
        duration_tenths: Option<u8>,
    },
    DistanceStep {
        direction: Direction,
        /// Step size in ticks; the previously stored size when absent.
        step_ticks: Option<u32>,
    },
    ClearEncoderCount,
    MoveToTarget { target_ticks: i32 },
    GetTargetPosition,
    SetOpenLoopSpeed { speed: u8 },
    GetOpenLoopSpeed,
    ClosedLoopState,
    MotorStatus,
    SetDriveMode { mode: DriveMode },
    GetDriveMode,
    SetClosedLoopSpeed { registers: SpeedRegisters },
    GetClosedLoopSpeed,
    SetSoftLimits {
        max_ticks: i32,
        min_ticks: i32,
        margin_ticks: u16,
    },
    GetSoftLimits,
    SetSoftLimitState { enabled: bool },
    TimeIntervalUnits,
    SetBaudRate { rate: BaudRate },
    GetBaudRate,
}

impl StageCommand {
    /// Absolute move to a setpoint in micrometers.
    pub fn move_to_target(setpoint_um: f64) -> Result<Self, ProtocolError> {
        Ok(Self::MoveToTarget {
            target_ticks: um_to_ticks(setpoint_um, "move target")?,
        })
    }

    /// Closed-loop step by a signed distance in micrometers.
    pub fn distance_step(delta_um: f64) -> Result<Self, ProtocolError> {
        let ticks = um_to_ticks(delta_um.abs(), "step size")?;
        Ok(Self::DistanceStep {
            direction: Direction::of(delta_um),
            step_ticks: Some(ticks as u32),
        })
    }

    /// Store a step size (in micrometers) without stepping.
    pub fn set_step_size(step_um: f64) -> Result<Self, ProtocolError> {
        let ticks = um_to_ticks(step_um.abs(), "step size")?;
        Ok(Self::DistanceStep {
            direction: Direction::Neither,
            step_ticks: Some(ticks as u32),
        })
    }

    /// Repeat the previously stored step in the given direction.
    pub fn step_again(direction: Direction) -> Self {
        Self::DistanceStep {
            direction,
            step_ticks: None,
        }
    }

    /// Run the motor, optionally for a fixed time (tenth-second
    /// resolution, 25.5 s maximum).
    pub fn run(direction: Direction, seconds: Option<f64>) -> Result<Self, ProtocolError> {
        if direction == Direction::Neither {
            return Err(ProtocolError::ValueOutOfRange {
                field: "run direction",
                value: f64::NAN,
            });
        }
        let duration_tenths = match seconds {
            None => None,
            Some(s) => {
                let tenths = (s * 10.0).round();
                if !(0.0..=255.0).contains(&tenths) {
                    return Err(ProtocolError::ValueOutOfRange {
                        field: "run duration",
                        value: s,
                    });
                }
                Some(tenths as u8)
            }
        };
        Ok(Self::Run {
            direction,
            duration_tenths,
        })
    }

    /// Open-loop speed as a percentage of full scale (must round to a
    /// nonzero byte).
    pub fn open_loop_speed(percent: f64) -> Result<Self, ProtocolError> {
        let byte = (percent / 100.0 * 255.0).round();
        if !(1.0..=255.0).contains(&byte) {
            return Err(ProtocolError::ValueOutOfRange {
                field: "open-loop speed",
                value: percent,
            });
        }
        Ok(Self::SetOpenLoopSpeed { speed: byte as u8 })
    }

    /// Closed-loop speed settings in physical units.
    pub fn closed_loop_speed(
        velocity_um_per_s: f64,
        acceleration_um_per_s2: f64,
        min_velocity_um_per_s: f64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::SetClosedLoopSpeed {
            registers: SpeedRegisters::from_physical(
                velocity_um_per_s,
                acceleration_um_per_s2,
                min_velocity_um_per_s,
                1,
            )?,
        })
    }

    /// Soft travel limits in micrometers, with a hysteresis margin.
    pub fn soft_limits(
        min_um: f64,
        max_um: f64,
        margin_um: f64,
    ) -> Result<Self, ProtocolError> {
        let margin = (margin_um * crate::units::TICKS_PER_UM).round();
        if !(0.0..=65_535.0).contains(&margin) {
            return Err(ProtocolError::ValueOutOfRange {
                field: "soft limit margin",
                value: margin_um,
            });
        }
        Ok(Self::SetSoftLimits {
            max_ticks: um_to_ticks(max_um, "soft limit maximum")?,
            min_ticks: um_to_ticks(min_um, "soft limit minimum")?,
            margin_ticks: margin as u16,
        })
    }

    pub fn opcode(&self) -> StageCmd {
        match self {
            Self::FirmwareVersion => StageCmd::FirmwareVersion,
            Self::ReleaseHostControl => StageCmd::ReleaseHostControl,
            Self::Halt => StageCmd::Halt,
            Self::Run { .. } => StageCmd::Run,
            Self::DistanceStep { .. } => StageCmd::StepClosedLoop,
            Self::ClearEncoderCount => StageCmd::ClearEncoderCount,
            Self::MoveToTarget { .. } | Self::GetTargetPosition => StageCmd::MoveToTarget,
            Self::SetOpenLoopSpeed { .. } | Self::GetOpenLoopSpeed => StageCmd::OpenLoopSpeed,
            Self::ClosedLoopState => StageCmd::ClosedLoopState,
            Self::MotorStatus => StageCmd::MotorStatus,
            Self::SetDriveMode { .. } | Self::GetDriveMode => StageCmd::DriveMode,
            Self::SetClosedLoopSpeed { .. } | Self::GetClosedLoopSpeed => {
                StageCmd::ClosedLoopSpeed
            }
            Self::SetSoftLimits { .. } | Self::GetSoftLimits => StageCmd::SoftLimitValues,
            Self::SetSoftLimitState { .. } => StageCmd::SoftLimitStates,
            Self::TimeIntervalUnits => StageCmd::TimeIntervalUnits,
            Self::SetBaudRate { .. } | Self::GetBaudRate => StageCmd::BaudRate,
        }
    }

    /// Render the wire frame, terminator included.
    pub fn encode(&self) -> String {
        let mut args: Vec<String> = Vec::new();
        match self {
            Self::FirmwareVersion
            | Self::ReleaseHostControl
            | Self::Halt
            | Self::ClearEncoderCount
            | Self::GetTargetPosition
            | Self::GetOpenLoopSpeed
            | Self::ClosedLoopState
            | Self::MotorStatus
            | Self::GetClosedLoopSpeed
            | Self::GetSoftLimits
            | Self::TimeIntervalUnits
            | Self::GetBaudRate => {}
            Self::Run {
                direction,
                duration_tenths,
            } => {
                args.push(direction.arg().to_string());
                if let Some(tenths) = duration_tenths {
                    args.push(format!("{tenths:04X}"));
                }
            }
            Self::DistanceStep {
                direction,
                step_ticks,
            } => {
                args.push(direction.arg().to_string());
                if let Some(ticks) = step_ticks {
                    args.push(format!("{ticks:08X}"));
                }
            }
            Self::MoveToTarget { target_ticks } => {
                // Two's complement, zero-stuffed to the 32-bit register width.
                args.push(format!("{:08X}", *target_ticks as u32));
            }
            Self::SetOpenLoopSpeed { speed } => args.push(format!("{speed:02X}")),
            Self::SetDriveMode { mode } => args.push(mode.arg().to_string()),
            Self::GetDriveMode => args.push("R".to_string()),
            Self::SetClosedLoopSpeed { registers } => {
                args.push(format!("{:06X}", registers.velocity));
                args.push(format!("{:06X}", registers.cutoff_velocity));
                args.push(format!("{:06X}", registers.acceleration));
                args.push(format!("{:04X}", registers.interval_count));
            }
            Self::SetSoftLimits {
                max_ticks,
                min_ticks,
                margin_ticks,
            } => {
                args.push(format!("{:08X}", *max_ticks as u32));
                args.push(format!("{:08X}", *min_ticks as u32));
                args.push(format!("{margin_ticks:04X}"));
            }
            Self::SetSoftLimitState { enabled } => {
                args.push(format!("{:04X}", u16::from(*enabled)));
            }
            Self::SetBaudRate { rate } => args.push(format!("{:02X}", rate.code())),
        }
        render_frame("", self.opcode().opcode(), &args)
    }
}

// =============================================================================
// Stage replies (decode)
// =============================================================================

/// One decoded stage reply. Commands that echo bare (no payload) decode
/// to [`StageReply::Ack`].
#[derive(Debug, Clone, PartialEq)]
pub enum StageReply {
    Ack(StageCmd),
    FirmwareVersion { version: u8, info: String },
    TargetPosition { ticks: i32 },
    OpenLoopSpeed { speed: u8 },
    ClosedLoopState {
        status: StatusWord,
        position_ticks: i32,
        error_ticks: i32,
    },
    MotorStatus { status: StatusWord },
    DriveMode { mode: DriveMode },
    ClosedLoopSpeed { registers: SpeedRegisters },
    SoftLimits {
        max_ticks: i32,
        min_ticks: i32,
        margin_ticks: u16,
    },
    SoftLimitState { enabled: bool },
    TimeIntervalUnits { interval_us: f64 },
    BaudRate { rate: BaudRate },
}

impl StageReply {
    pub fn opcode(&self) -> StageCmd {
        match self {
            Self::Ack(cmd) => *cmd,
            Self::FirmwareVersion { .. } => StageCmd::FirmwareVersion,
            Self::TargetPosition { .. } => StageCmd::MoveToTarget,
            Self::OpenLoopSpeed { .. } => StageCmd::OpenLoopSpeed,
            Self::ClosedLoopState { .. } => StageCmd::ClosedLoopState,
            Self::MotorStatus { .. } => StageCmd::MotorStatus,
            Self::DriveMode { .. } => StageCmd::DriveMode,
            Self::ClosedLoopSpeed { .. } => StageCmd::ClosedLoopSpeed,
            Self::SoftLimits { .. } => StageCmd::SoftLimitValues,
            Self::SoftLimitState { .. } => StageCmd::SoftLimitStates,
            Self::TimeIntervalUnits { .. } => StageCmd::TimeIntervalUnits,
            Self::BaudRate { .. } => StageCmd::BaudRate,
        }
    }

    /// Decode a raw reply frame (terminator included).
    ///
    /// Device-reported rejections (`<24>`, `<23>`) decode to the
    /// corresponding [`ProtocolError`] so callers never mistake them for
    /// payloads.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let body = frame_body(raw, "")?;
        let mut tokens = body.split(' ').filter(|t| !t.is_empty());
        let opcode_tok = tokens
            .next()
            .ok_or_else(|| ProtocolError::malformed(raw, "empty frame"))?;
        let cmd = StageCmd::from_opcode(opcode_tok)
            .ok_or_else(|| ProtocolError::malformed(raw, "unknown opcode"))?;
        let tokens: Vec<&str> = tokens.collect();

        // The device reports rejections with their own opcodes, possibly
        // with trailing arguments; both map straight to errors.
        match cmd {
            StageCmd::IllegalCommand => return Err(ProtocolError::IllegalCommand),
            StageCmd::IllegalCommandFormat => return Err(ProtocolError::IllegalCommandFormat),
            _ => {}
        }
        if tokens.is_empty() {
            return Ok(Self::Ack(cmd));
        }

        match cmd {
            StageCmd::FirmwareVersion => {
                let version = parse_unsigned(tokens[0], 4, raw)? as u8;
                let info = tokens[1..].join(" ");
                Ok(Self::FirmwareVersion { version, info })
            }
            StageCmd::MoveToTarget => {
                expect_fields(&tokens, 1, raw)?;
                Ok(Self::TargetPosition {
                    ticks: parse_signed(tokens[0], 32, raw)?,
                })
            }
            StageCmd::OpenLoopSpeed => {
                expect_fields(&tokens, 1, raw)?;
                Ok(Self::OpenLoopSpeed {
                    speed: parse_unsigned(tokens[0], 8, raw)? as u8,
                })
            }
            StageCmd::ClosedLoopState => {
                expect_fields(&tokens, 3, raw)?;
                Ok(Self::ClosedLoopState {
                    status: StatusWord::from_raw(parse_unsigned(tokens[0], 24, raw)?),
                    position_ticks: parse_signed(tokens[1], 32, raw)?,
                    error_ticks: parse_signed(tokens[2], 32, raw)?,
                })
            }
            StageCmd::MotorStatus => {
                expect_fields(&tokens, 1, raw)?;
                // Low 16 bits of the shared status layout.
                Ok(Self::MotorStatus {
                    status: StatusWord::from_raw(parse_unsigned(tokens[0], 16, raw)?),
                })
            }
            StageCmd::DriveMode => {
                // Single nibble; the controller may append a diagnostic
                // word which carries no documented meaning.
                let code = parse_unsigned(tokens[0], 4, raw)?;
                let mode = DriveMode::from_code(code)
                    .ok_or_else(|| ProtocolError::malformed(raw, "unknown drive mode"))?;
                Ok(Self::DriveMode { mode })
            }
            StageCmd::ClosedLoopSpeed => {
                expect_fields(&tokens, 4, raw)?;
                Ok(Self::ClosedLoopSpeed {
                    registers: SpeedRegisters {
                        velocity: parse_unsigned(tokens[0], 24, raw)?,
                        cutoff_velocity: parse_unsigned(tokens[1], 24, raw)?,
                        acceleration: parse_unsigned(tokens[2], 24, raw)?,
                        interval_count: parse_unsigned(tokens[3], 16, raw)? as u16,
                    },
                })
            }
            StageCmd::SoftLimitValues => {
                expect_fields(&tokens, 3, raw)?;
                Ok(Self::SoftLimits {
                    max_ticks: parse_signed(tokens[0], 32, raw)?,
                    min_ticks: parse_signed(tokens[1], 32, raw)?,
                    margin_ticks: parse_unsigned(tokens[2], 16, raw)? as u16,
                })
            }
            StageCmd::SoftLimitStates => {
                // The set echo is zero-stuffed to four digits, the query
                // reply is a bare nibble; accept either width.
                expect_fields(&tokens, 1, raw)?;
                Ok(Self::SoftLimitState {
                    enabled: parse_flag(tokens[0], raw)?,
                })
            }
            StageCmd::TimeIntervalUnits => {
                // Decimal value followed by the literal unit, e.g. "10.0 USEC".
                expect_fields(&tokens, 2, raw)?;
                if !tokens[1].eq_ignore_ascii_case("USEC") {
                    return Err(ProtocolError::malformed(raw, "unexpected interval unit"));
                }
                let interval_us: f64 = tokens[0]
                    .parse()
                    .map_err(|_| ProtocolError::malformed(raw, "invalid interval value"))?;
                Ok(Self::TimeIntervalUnits { interval_us })
            }
            StageCmd::BaudRate => {
                // Set echo: one code byte. Query reply: index nibble then code byte.
                let code_tok = match tokens.len() {
                    1 => tokens[0],
                    2 => tokens[1],
                    _ => return Err(ProtocolError::malformed(raw, "wrong field count")),
                };
                let code = parse_unsigned(code_tok, 8, raw)? as u8;
                let rate = BaudRate::from_code(code)
                    .ok_or_else(|| ProtocolError::malformed(raw, "unknown baud code"))?;
                Ok(Self::BaudRate { rate })
            }
            // Motion and housekeeping commands echo their arguments back;
            // the payload carries nothing beyond the acknowledgement.
            StageCmd::ReleaseHostControl
            | StageCmd::Halt
            | StageCmd::Run
            | StageCmd::StepClosedLoop
            | StageCmd::ClearEncoderCount => Ok(Self::Ack(cmd)),
            StageCmd::IllegalCommand | StageCmd::IllegalCommandFormat => unreachable!(),
        }
    }
}

// =============================================================================
// Transceiver commands and replies
// =============================================================================

/// Commands addressed to the interface box rather than a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverCommand {
    FirmwareVersion,
    /// Route subsequent stage frames to the given axis address.
    StageSelect { address: u8 },
    GetSelectedStage,
    SetBaudRate { rate: BaudRate },
    GetBaudRate,
    MacAddress,
}

impl TransceiverCommand {
    pub fn opcode(&self) -> TransceiverCmd {
        match self {
            Self::FirmwareVersion => TransceiverCmd::FirmwareVersion,
            Self::StageSelect { .. } | Self::GetSelectedStage => TransceiverCmd::StageSelect,
            Self::SetBaudRate { .. } | Self::GetBaudRate => TransceiverCmd::BaudRate,
            Self::MacAddress => TransceiverCmd::MacAddress,
        }
    }

    pub fn encode(&self) -> String {
        let mut args: Vec<String> = Vec::new();
        match self {
            Self::FirmwareVersion | Self::GetSelectedStage | Self::GetBaudRate | Self::MacAddress => {}
            Self::StageSelect { address } => args.push(format!("{address:02X}")),
            Self::SetBaudRate { rate } => args.push(format!("{:02X}", rate.code())),
        }
        render_frame(TR_PREFIX, self.opcode().opcode(), &args)
    }
}

/// Decoded transceiver reply (`TR<…>` framing).
#[derive(Debug, Clone, PartialEq)]
pub enum TransceiverReply {
    Ack(TransceiverCmd),
    FirmwareVersion { version: u8, info: String },
    StageSelect { address: u8, active: bool },
    BaudRate { rate: BaudRate },
    MacAddress { mac: String },
}

impl TransceiverReply {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let body = frame_body(raw, TR_PREFIX)?;
        let mut tokens = body.split(' ').filter(|t| !t.is_empty());
        let opcode_tok = tokens
            .next()
            .ok_or_else(|| ProtocolError::malformed(raw, "empty frame"))?;
        let cmd = TransceiverCmd::from_opcode(opcode_tok)
            .ok_or_else(|| ProtocolError::malformed(raw, "unknown opcode"))?;
        let tokens: Vec<&str> = tokens.collect();
        if tokens.is_empty() {
            return Ok(Self::Ack(cmd));
        }

        match cmd {
            TransceiverCmd::FirmwareVersion => Ok(Self::FirmwareVersion {
                version: parse_unsigned(tokens[0], 4, raw)? as u8,
                info: tokens[1..].join(" "),
            }),
            TransceiverCmd::StageSelect => {
                let address = parse_unsigned(tokens[0], 8, raw)? as u8;
                let active = match tokens.len() {
                    1 => true,
                    2 => parse_flag(tokens[1], raw)?,
                    _ => return Err(ProtocolError::malformed(raw, "wrong field count")),
                };
                Ok(Self::StageSelect { address, active })
            }
            TransceiverCmd::BaudRate => {
                let code_tok = match tokens.len() {
                    1 => tokens[0],
                    2 => tokens[1],
                    _ => return Err(ProtocolError::malformed(raw, "wrong field count")),
                };
                let code = parse_unsigned(code_tok, 8, raw)? as u8;
                let rate = BaudRate::from_code(code)
                    .ok_or_else(|| ProtocolError::malformed(raw, "unknown baud code"))?;
                Ok(Self::BaudRate { rate })
            }
            TransceiverCmd::MacAddress => Ok(Self::MacAddress {
                mac: tokens.join(" "),
            }),
        }
    }
}

// =============================================================================
// Framing and field parsing
// =============================================================================

fn render_frame(prefix: &str, opcode: &str, args: &[String]) -> String {
    let mut frame = String::with_capacity(8 + 9 * args.len());
    frame.push_str(prefix);
    frame.push('<');
    frame.push_str(opcode);
    for arg in args {
        frame.push(' ');
        frame.push_str(arg);
    }
    frame.push('>');
    frame.push(TERMINATOR as char);
    frame
}

/// Structural validation: required prefix, `<`/`>` wrapping, and the CR
/// terminator must all be present before any payload byte is touched.
fn frame_body<'a>(raw: &'a str, prefix: &str) -> Result<&'a str, ProtocolError> {
    let rest = raw
        .strip_suffix('\r')
        .ok_or_else(|| ProtocolError::malformed(raw, "missing CR terminator"))?;
    let rest = rest
        .strip_prefix(prefix)
        .ok_or_else(|| ProtocolError::malformed(raw, "missing frame prefix"))?;
    let rest = rest
        .strip_prefix('<')
        .ok_or_else(|| ProtocolError::malformed(raw, "missing opening delimiter"))?;
    let body = rest
        .strip_suffix('>')
        .ok_or_else(|| ProtocolError::malformed(raw, "missing closing delimiter"))?;
    if body.contains(&['<', '>', '\r'][..]) {
        return Err(ProtocolError::malformed(raw, "embedded delimiter"));
    }
    Ok(body)
}

fn expect_fields(tokens: &[&str], count: usize, raw: &str) -> Result<(), ProtocolError> {
    if tokens.len() == count {
        Ok(())
    } else {
        Err(ProtocolError::malformed(raw, "wrong field count"))
    }
}

/// Parse a fixed-width unsigned hex field. The token must be exactly
/// `bits / 4` digits; a short token is a truncated frame, not a smaller
/// number.
fn parse_unsigned(token: &str, bits: u32, raw: &str) -> Result<u32, ProtocolError> {
    let width = (bits / 4) as usize;
    if token.len() != width {
        return Err(ProtocolError::malformed(raw, "wrong field width"));
    }
    u32::from_str_radix(token, 16).map_err(|_| ProtocolError::malformed(raw, "invalid hex field"))
}

/// Parse a fixed-width two's-complement hex field with sign extension.
fn parse_signed(token: &str, bits: u32, raw: &str) -> Result<i32, ProtocolError> {
    let value = parse_unsigned(token, bits, raw)?;
    if bits == 32 {
        return Ok(value as i32);
    }
    let sign = 1u32 << (bits - 1);
    if value & sign != 0 {
        Ok((value | !(sign | (sign - 1))) as i32)
    } else {
        Ok(value as i32)
    }
}

/// Parse a boolean flag field whose width varies between the set echo
/// (zero-stuffed) and the query reply (bare nibble).
fn parse_flag(token: &str, raw: &str) -> Result<bool, ProtocolError> {
    if token.is_empty() || token.len() > 4 {
        return Err(ProtocolError::malformed(raw, "wrong field width"));
    }
    let value = u32::from_str_radix(token, 16)
        .map_err(|_| ProtocolError::malformed(raw, "invalid hex field"))?;
    Ok(value != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StateBit;
    use crate::units::ticks_to_um;

    #[test]
    fn encode_move_to_target_frames() {
        let cmd = StageCommand::move_to_target(2500.0).unwrap();
        assert_eq!(cmd.encode(), "<08 00001388>\r"); // 2500 um = 5000 ticks

        let cmd = StageCommand::move_to_target(-625.0).unwrap();
        assert_eq!(cmd.encode(), "<08 FFFFFB1E>\r"); // -1250 ticks, two's complement
    }

    #[test]
    fn encode_queries_and_motion_commands() {
        assert_eq!(StageCommand::FirmwareVersion.encode(), "<01>\r");
        assert_eq!(StageCommand::Halt.encode(), "<03>\r");
        assert_eq!(StageCommand::ClosedLoopState.encode(), "<10>\r");
        assert_eq!(StageCommand::MotorStatus.encode(), "<19>\r");
        assert_eq!(StageCommand::GetTargetPosition.encode(), "<08>\r");
        assert_eq!(StageCommand::GetDriveMode.encode(), "<20 R>\r");
        assert_eq!(
            StageCommand::SetDriveMode {
                mode: DriveMode::ClosedLoop
            }
            .encode(),
            "<20 1>\r"
        );
        assert_eq!(
            StageCommand::run(Direction::Forward, Some(1.0)).unwrap().encode(),
            "<04 1 000A>\r"
        );
        assert_eq!(
            StageCommand::run(Direction::Backward, None).unwrap().encode(),
            "<04 0>\r"
        );
        assert_eq!(
            StageCommand::distance_step(-10.0).unwrap().encode(),
            "<06 0 00000014>\r"
        );
        assert_eq!(
            StageCommand::set_step_size(10.0).unwrap().encode(),
            "<06 N 00000014>\r"
        );
        assert_eq!(
            StageCommand::SetBaudRate {
                rate: BaudRate::B250000
            }
            .encode(),
            "<54 04>\r"
        );
        assert_eq!(
            StageCommand::SetSoftLimitState { enabled: true }.encode(),
            "<47 0001>\r"
        );
    }

    #[test]
    fn encode_rejects_out_of_range_values() {
        assert!(StageCommand::move_to_target(2e9).is_err());
        assert!(StageCommand::run(Direction::Forward, Some(30.0)).is_err());
        assert!(StageCommand::run(Direction::Neither, None).is_err());
        assert!(StageCommand::open_loop_speed(0.0).is_err());
        assert!(StageCommand::open_loop_speed(120.0).is_err());
        assert!(StageCommand::soft_limits(0.0, 10.0, 1e9).is_err());
    }

    #[test]
    fn position_round_trips_at_register_extremes() {
        // The device echoes the setpoint with the same field layout, so the
        // encoded frame doubles as the expected reply.
        for ticks in [i32::MIN, -1250, -1, 0, 1, 1250, i32::MAX] {
            let um = ticks_to_um(ticks);
            let frame = StageCommand::move_to_target(um).unwrap().encode();
            match StageReply::decode(&frame) {
                Ok(StageReply::TargetPosition { ticks: got }) => assert_eq!(got, ticks),
                other => panic!("unexpected decode result: {other:?}"),
            }
        }
    }

    #[test]
    fn decode_closed_loop_state() {
        // Running + moving-toward-target, position 5000 ticks, error -2 ticks.
        let raw = format!(
            "<10 {:06X} {:08X} {:08X}>\r",
            StateBit::Running.mask() | StateBit::MovingTowardTarget.mask(),
            5000u32,
            (-2i32) as u32
        );
        match StageReply::decode(&raw).unwrap() {
            StageReply::ClosedLoopState {
                status,
                position_ticks,
                error_ticks,
            } => {
                assert!(status.is_running());
                assert!(status.moving_toward_target());
                assert_eq!(position_ticks, 5000);
                assert_eq!(error_ticks, -2);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn decode_motor_status_is_low_16_bits() {
        let raw = format!("<19 {:04X}>\r", StateBit::Running.mask() as u16);
        match StageReply::decode(&raw).unwrap() {
            StageReply::MotorStatus { status } => {
                assert!(status.is_running());
                assert!(!status.on_target()); // bit 18 cannot appear in 16-bit form
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn decode_firmware_version_with_spaces() {
        match StageReply::decode("<01 4 M3-LS-3.4-15 R4.02>\r").unwrap() {
            StageReply::FirmwareVersion { version, info } => {
                assert_eq!(version, 4);
                assert_eq!(info, "M3-LS-3.4-15 R4.02");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn decode_time_interval_units() {
        match StageReply::decode("<52 10.0 USEC>\r").unwrap() {
            StageReply::TimeIntervalUnits { interval_us } => assert_eq!(interval_us, 10.0),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(StageReply::decode("<52 10.0 MSEC>\r").is_err());
    }

    #[test]
    fn decode_baud_rate_both_forms() {
        assert_eq!(
            StageReply::decode("<54 04>\r").unwrap(),
            StageReply::BaudRate {
                rate: BaudRate::B250000
            }
        );
        assert_eq!(
            StageReply::decode("<54 0 03>\r").unwrap(),
            StageReply::BaudRate {
                rate: BaudRate::B115200
            }
        );
        assert!(StageReply::decode("<54 0 09>\r").is_err());
    }

    #[test]
    fn bare_echo_decodes_to_ack() {
        assert_eq!(
            StageReply::decode("<03>\r").unwrap(),
            StageReply::Ack(StageCmd::Halt)
        );
        assert_eq!(
            StageReply::decode("<04 1 000A>\r").unwrap(),
            StageReply::Ack(StageCmd::Run)
        );
        assert_eq!(
            StageReply::decode("<07>\r").unwrap(),
            StageReply::Ack(StageCmd::ClearEncoderCount)
        );
    }

    #[test]
    fn illegal_command_replies_map_to_errors() {
        assert_eq!(
            StageReply::decode("<24>\r").unwrap_err(),
            ProtocolError::IllegalCommand
        );
        // Rejections can carry the offending arguments; still an error.
        assert_eq!(
            StageReply::decode("<24 08 0000>\r").unwrap_err(),
            ProtocolError::IllegalCommand
        );
        assert_eq!(
            StageReply::decode("<23>\r").unwrap_err(),
            ProtocolError::IllegalCommandFormat
        );
    }

    #[test]
    fn malformed_frames_never_decode_to_values() {
        let cases = [
            "",                     // empty
            "<10 000004",           // truncated, no terminator
            "<10 000004 00001388 00000000>", // missing CR
            "10 000004 00001388 00000000>\r", // missing opening delimiter
            "<10 000004 00001388 00000000\r", // missing closing delimiter
            "<>\r",                 // no opcode
            "<99>\r",               // unknown opcode
            "<10 0004 00001388 00000000>\r", // status field too short
            "<10 000004 00001388>\r",        // field missing
            "<19 ZZZZ>\r",          // non-hex payload
            "<08 1388>\r",          // position field too short
        ];
        for raw in cases {
            match StageReply::decode(raw) {
                Err(ProtocolError::Malformed { .. }) => {}
                other => panic!("{raw:?} should be malformed, got {other:?}"),
            }
        }
    }

    #[test]
    fn transceiver_select_round_trip() {
        let cmd = TransceiverCommand::StageSelect { address: 0x02 };
        assert_eq!(cmd.encode(), "TR<A0 02>\r");
        match TransceiverReply::decode("TR<A0 02 1>\r").unwrap() {
            TransceiverReply::StageSelect { address, active } => {
                assert_eq!(address, 0x02);
                assert!(active);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        // A stage-framed reply must not pass transceiver decoding.
        assert!(matches!(
            TransceiverReply::decode("<A0 02 1>\r"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn signed_field_widths_sign_extend() {
        // 24-bit negative value in a closed-loop-speed style field would be
        // unsigned; exercise parse_signed through the 32-bit position and a
        // synthetic 16-bit case via the helper directly.
        assert_eq!(parse_signed("FFFF", 16, "t").unwrap(), -1);
        assert_eq!(parse_signed("8000", 16, "t").unwrap(), -32768);
        assert_eq!(parse_signed("7FFF", 16, "t").unwrap(), 32767);
        assert_eq!(parse_signed("FFFFFF", 24, "t").unwrap(), -1);
        assert_eq!(parse_signed("800000", 24, "t").unwrap(), -8_388_608);
    }
}
