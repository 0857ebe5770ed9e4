//! Fixed-point unit conversions.
//!
//! The device works in encoder ticks and register counts; the public
//! driver API works in micrometers. All conversion constants live here
//! and nowhere else.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Encoder ticks per micrometer of travel.
pub const TICKS_PER_UM: f64 = 2.0;

/// Encoder resolution in nanometers. Fixed, used for speed register math.
pub const ENC_RES_NM: f64 = 500.0;

/// Servo interval in microseconds. Fixed, used for speed register math.
pub const INTERVAL_US: f64 = 1000.0;

/// Convert a position or distance in micrometers to signed encoder ticks,
/// rejecting values outside the 32-bit register range.
pub fn um_to_ticks(um: f64, field: &'static str) -> Result<i32, ProtocolError> {
    let ticks = (um * TICKS_PER_UM).round();
    if !ticks.is_finite() || ticks < i32::MIN as f64 || ticks > i32::MAX as f64 {
        return Err(ProtocolError::ValueOutOfRange { field, value: um });
    }
    Ok(ticks as i32)
}

/// Convert signed encoder ticks back to micrometers.
pub fn ticks_to_um(ticks: i32) -> f64 {
    ticks as f64 / TICKS_PER_UM
}

/// Raw closed-loop speed registers, exactly as they cross the wire
/// (three 24-bit counts plus a 16-bit interval count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedRegisters {
    /// Velocity in 1/256 counts per interval.
    pub velocity: u32,
    /// Cutoff (minimum) velocity in 1/256 counts per interval.
    pub cutoff_velocity: u32,
    /// Acceleration in 1/256 counts per interval squared.
    pub acceleration: u32,
    /// Interval duration in servo intervals. Leave at 1.
    pub interval_count: u16,
}

/// Closed-loop speed settings in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosedLoopSpeed {
    pub velocity_um_per_s: f64,
    pub acceleration_um_per_s2: f64,
    pub min_velocity_um_per_s: f64,
    pub interval_count: u16,
}

const MAX_U24: u32 = 0x00FF_FFFF;

impl SpeedRegisters {
    /// Build register values from physical speed settings.
    ///
    /// Register equations come from the datasheet; velocities are scaled
    /// by 256 into fixed-point counts per servo interval.
    pub fn from_physical(
        velocity_um_per_s: f64,
        acceleration_um_per_s2: f64,
        min_velocity_um_per_s: f64,
        interval_count: u16,
    ) -> Result<Self, ProtocolError> {
        if velocity_um_per_s <= min_velocity_um_per_s {
            return Err(ProtocolError::ValueOutOfRange {
                field: "velocity (must exceed minimum velocity)",
                value: velocity_um_per_s,
            });
        }
        if acceleration_um_per_s2 <= 0.0 {
            return Err(ProtocolError::ValueOutOfRange {
                field: "acceleration",
                value: acceleration_um_per_s2,
            });
        }
        let um_per_count = ENC_RES_NM / 1e3;
        let interval_s = interval_count as f64 * (INTERVAL_US / 1e6);

        let velocity = ((velocity_um_per_s / um_per_count) * 256.0 * interval_s).round();
        let cutoff = ((min_velocity_um_per_s / um_per_count) * 256.0 * interval_s).round();
        let acceleration = (velocity / (velocity_um_per_s / acceleration_um_per_s2)
            * interval_s)
            .round();

        let check = |value: f64, field: &'static str| -> Result<u32, ProtocolError> {
            if value < 0.0 || value > MAX_U24 as f64 {
                Err(ProtocolError::ValueOutOfRange { field, value })
            } else {
                Ok(value as u32)
            }
        };
        Ok(Self {
            velocity: check(velocity, "velocity register")?,
            cutoff_velocity: check(cutoff, "cutoff velocity register")?,
            acceleration: check(acceleration, "acceleration register")?,
            interval_count,
        })
    }

    /// Convert register values back to physical units.
    pub fn to_physical(self) -> ClosedLoopSpeed {
        let interval = self.interval_count.max(1) as f64;
        let counts_to_um_per_s = (ENC_RES_NM * 1e6) / (1e3 * 256.0 * interval * INTERVAL_US);
        let velocity_um_per_s = self.velocity as f64 * counts_to_um_per_s;
        let min_velocity_um_per_s = self.cutoff_velocity as f64 * counts_to_um_per_s;
        let acceleration_um_per_s2 = if self.velocity == 0 {
            0.0
        } else {
            (velocity_um_per_s * self.acceleration as f64 * 1e6)
                / (self.velocity as f64 * interval * INTERVAL_US)
        };
        ClosedLoopSpeed {
            velocity_um_per_s,
            acceleration_um_per_s2,
            min_velocity_um_per_s,
            interval_count: self.interval_count,
        }
    }
}
