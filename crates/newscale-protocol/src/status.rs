//! Status word bit field.
//!
//! The stage reports its state as a 24-bit integer in the `<10>` reply
//! (and the low 16 bits of the same layout in the `<19>` motor status
//! reply). Bits signal independent conditions; several may be set at
//! once. The layout is fixed per firmware generation and must not be
//! reinterpreted across device types.

use crate::command::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named bit offsets within the status word.
///
/// Offsets 0, 8 and 12-14 are reserved by the firmware; they are not
/// named here but are preserved in [`StatusWord::raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StateBit {
    /// 0 = backward, 1 = forward.
    Direction = 1,
    Running = 2,
    DriverNotResponsive = 3,
    BurstMode = 4,
    TimedRun = 5,
    MultiplexedAxis = 6,
    HostControlEstablished = 7,
    ForwardLimitReached = 9,
    ReverseLimitReached = 10,
    /// 0 = amplitude mode, 1 = burst mode.
    Mode = 11,
    BackgroundJobActive = 15,
    EncoderError = 16,
    ZeroReferenceEnabled = 17,
    OnTarget = 18,
    MovingTowardTarget = 19,
    MaintenanceModeEnabled = 20,
    ClosedLoopEnabled = 21,
    Accelerating = 22,
    Stalled = 23,
}

impl StateBit {
    /// All defined (non-reserved) bits, lsb first.
    pub const ALL: [StateBit; 19] = [
        StateBit::Direction,
        StateBit::Running,
        StateBit::DriverNotResponsive,
        StateBit::BurstMode,
        StateBit::TimedRun,
        StateBit::MultiplexedAxis,
        StateBit::HostControlEstablished,
        StateBit::ForwardLimitReached,
        StateBit::ReverseLimitReached,
        StateBit::Mode,
        StateBit::BackgroundJobActive,
        StateBit::EncoderError,
        StateBit::ZeroReferenceEnabled,
        StateBit::OnTarget,
        StateBit::MovingTowardTarget,
        StateBit::MaintenanceModeEnabled,
        StateBit::ClosedLoopEnabled,
        StateBit::Accelerating,
        StateBit::Stalled,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn mask(self) -> u32 {
        1 << self.index()
    }
}

/// Waveform mode flag carried in [`StateBit::Mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionMode {
    Amplitude,
    Burst,
}

/// The 24-bit device status word, kept raw so reserved and future bits
/// survive decode/re-encode intact.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusWord(u32);

/// Mask of bits with no assigned meaning in this firmware generation.
const RESERVED_MASK: u32 = (1 << 0) | (1 << 8) | (1 << 12) | (1 << 13) | (1 << 14);

impl StatusWord {
    pub const WIDTH_BITS: u32 = 24;

    pub fn from_raw(raw: u32) -> Self {
        Self(raw & 0x00FF_FFFF)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn contains(self, bit: StateBit) -> bool {
        self.0 & bit.mask() != 0
    }

    /// The defined bits currently set, lsb first.
    pub fn set_bits(self) -> Vec<StateBit> {
        StateBit::ALL
            .into_iter()
            .filter(|b| self.contains(*b))
            .collect()
    }

    /// Reserved bits that the device set anyway. Nonzero here means the
    /// firmware is reporting something this table does not know about.
    pub fn reserved_bits(self) -> u32 {
        self.0 & RESERVED_MASK
    }

    pub fn direction(self) -> Direction {
        if self.contains(StateBit::Direction) {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    pub fn mode(self) -> MotionMode {
        if self.contains(StateBit::Mode) {
            MotionMode::Burst
        } else {
            MotionMode::Amplitude
        }
    }

    pub fn is_running(self) -> bool {
        self.contains(StateBit::Running)
    }

    pub fn timed_run(self) -> bool {
        self.contains(StateBit::TimedRun)
    }

    pub fn host_control_established(self) -> bool {
        self.contains(StateBit::HostControlEstablished)
    }

    pub fn forward_limit_reached(self) -> bool {
        self.contains(StateBit::ForwardLimitReached)
    }

    pub fn reverse_limit_reached(self) -> bool {
        self.contains(StateBit::ReverseLimitReached)
    }

    pub fn background_job_active(self) -> bool {
        self.contains(StateBit::BackgroundJobActive)
    }

    pub fn encoder_error(self) -> bool {
        self.contains(StateBit::EncoderError)
    }

    pub fn zero_reference_enabled(self) -> bool {
        self.contains(StateBit::ZeroReferenceEnabled)
    }

    pub fn on_target(self) -> bool {
        self.contains(StateBit::OnTarget)
    }

    pub fn moving_toward_target(self) -> bool {
        self.contains(StateBit::MovingTowardTarget)
    }

    pub fn maintenance_mode_enabled(self) -> bool {
        self.contains(StateBit::MaintenanceModeEnabled)
    }

    pub fn closed_loop_enabled(self) -> bool {
        self.contains(StateBit::ClosedLoopEnabled)
    }

    pub fn accelerating(self) -> bool {
        self.contains(StateBit::Accelerating)
    }

    pub fn stalled(self) -> bool {
        self.contains(StateBit::Stalled)
    }

    pub fn driver_not_responsive(self) -> bool {
        self.contains(StateBit::DriverNotResponsive)
    }

    /// Whether any fault condition is active (stall, dead driver chip,
    /// encoder fault). Sticky until the axis is halted and recovers.
    pub fn has_fault(self) -> bool {
        self.stalled() || self.driver_not_responsive() || self.encoder_error()
    }

    /// Settled at the commanded setpoint: on target and no longer running.
    pub fn settled(self) -> bool {
        self.on_target() && !self.is_running()
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord({:#08x}", self.0)?;
        for bit in self.set_bits() {
            write!(f, " {bit:?}")?;
        }
        write!(f, ")")
    }
}
