mod driver;
mod engine;
mod shared;
mod timer;

pub use driver::*;
pub use engine::*;
pub use shared::*;
pub use timer::*;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of [`DutyCycle`] units in a full period.
pub const DUTY_FULL_SCALE: u16 = 10_000;

/// Duty cycle in hundredths of a percent, `0..=10_000`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub struct DutyCycle(u16);

impl DutyCycle {
    pub const OFF: DutyCycle = DutyCycle(0);
    pub const FULL: DutyCycle = DutyCycle(DUTY_FULL_SCALE);

    /// Clamps anything above full scale.
    pub const fn from_raw(raw: u16) -> Self {
        if raw > DUTY_FULL_SCALE {
            Self::FULL
        } else {
            Self(raw)
        }
    }

    /// Converts a controller output in duty units, clamping into range.
    pub fn from_output(output: i32) -> Self {
        Self(output.clamp(0, i32::from(DUTY_FULL_SCALE)) as u16)
    }

    pub fn from_percent(percent: u8) -> Self {
        Self::from_raw(u16::from(percent).saturating_mul(100))
    }

    /// Half-percent steps, `200` being fully on.
    pub fn from_half_percent(half_percent: u16) -> Self {
        Self::from_raw(half_percent.saturating_mul(50))
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_off(self) -> bool {
        self.0 == 0
    }

    pub const fn is_full(self) -> bool {
        self.0 >= DUTY_FULL_SCALE
    }

    /// High time within a period of `period` ticks, rounded to nearest.
    pub fn ticks(self, period: u16) -> u16 {
        let full = u32::from(DUTY_FULL_SCALE);
        ((u32::from(self.0) * u32::from(period) + full / 2) / full) as u16
    }
}

impl From<u16> for DutyCycle {
    fn from(raw: u16) -> Self {
        Self::from_raw(raw)
    }
}

impl From<DutyCycle> for u16 {
    fn from(duty: DutyCycle) -> Self {
        duty.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    A,
    B,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::A, ChannelId::B];

    pub const fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }
}

/// Carrier setup, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmConfig {
    /// Compare timer tick rate.
    pub timer_hz: u32,
    pub carrier_hz: u16,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            timer_hz: 250_000,
            carrier_hz: 30,
        }
    }
}

impl PwmConfig {
    /// Carrier period in timer ticks.
    pub fn period(&self) -> Result<u16> {
        if self.carrier_hz == 0 {
            return Err(Error::InvalidCarrier);
        }
        let ticks = self.timer_hz / u32::from(self.carrier_hz);
        if ticks < 2 {
            return Err(Error::InvalidCarrier);
        }
        u16::try_from(ticks).map_err(|_| Error::InvalidCarrier)
    }
}
