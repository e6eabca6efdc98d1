mod ideal;
mod pid;

pub use ideal::*;
pub use pid::*;

use core::num::NonZeroU16;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_SAMPLE_TIME: NonZeroU16 = match NonZeroU16::new(100) {
    Some(v) => v,
    None => NonZeroU16::MIN,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Raising the output raises the measurement.
    #[default]
    Direct,
    Reverse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PIDMode {
    #[default]
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Proportional {
    #[default]
    OnError,
    /// Proportional action follows the measurement, so a setpoint step does
    /// not produce a step in the output.
    OnMeasurement,
}

/// User-facing tuning of a controller.
///
/// Gains are entered as integers. [`StandardPID`] reads them in hundredths
/// (`kp = 150` is a gain of 1.5 output units per unit of error, `ki` per
/// second, `kd` per unit per second). [`IdealPID`] reads them in tenths of
/// output units per unit of dimensionless error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PIDParams {
    pub kp: u16,
    pub ki: u16,
    pub kd: u16,
    pub direction: Direction,
    pub min_output: i32,
    pub max_output: i32,
    pub sample_time_ms: u16,
    /// Input range compression, `0..=5000`. Only the ideal form uses it.
    pub sensitivity: u16,
}

impl Default for PIDParams {
    fn default() -> Self {
        Self {
            kp: 100,
            ki: 20,
            kd: 0,
            direction: Direction::Direct,
            min_output: 0,
            max_output: 10_000,
            sample_time_ms: DEFAULT_SAMPLE_TIME.get(),
            sensitivity: 0,
        }
    }
}

/// Common interface of the integer PID strategies.
///
/// Invalid settings (inverted limits, zero sample time) are ignored and the
/// previously valid value is kept. Nothing here returns an error or panics.
pub trait PIDController {
    fn new(params: &PIDParams) -> Self
    where
        Self: Sized;

    /// Sets the output clamp. `min >= max` is ignored.
    fn set_output_limits(&mut self, min: i32, max: i32);

    /// Stores new gains. Unchanged values are a no-op, so this is safe to
    /// call on every control tick.
    fn set_tunings(&mut self, kp: u16, ki: u16, kd: u16, direction: Direction);

    /// Sets the minimum interval between two computations. Zero is ignored.
    fn set_sample_time(&mut self, sample_time_ms: u16);

    fn set_sensitivity(&mut self, _sensitivity: u16) {}

    fn set_mode(&mut self, mode: PIDMode);

    /// Records the output applied from outside while in manual mode, so the
    /// switch back to automatic continues from it. Ignored in automatic mode.
    fn set_manual_output(&mut self, output: i32);

    /// Bumpless reset of the accumulated state.
    fn initialize(&mut self);

    /// Runs one step at `now_ms`, returning `None` when less than one sample
    /// interval has passed since the previous step or the controller is in
    /// manual mode.
    fn compute(
        &mut self,
        now_ms: u32,
        input: i32,
        setpoint: i32,
        proportional: Proportional,
        feed_forward: i32,
    ) -> Option<i32>;

    fn output_limits(&self) -> (i32, i32);

    fn last_output(&self) -> i32;

    fn mode(&self) -> PIDMode;

    fn params(&self) -> PIDParams;

    /// Pushes a full parameter set through the individual setters.
    fn apply(&mut self, params: &PIDParams) {
        self.set_sample_time(params.sample_time_ms);
        self.set_output_limits(params.min_output, params.max_output);
        self.set_sensitivity(params.sensitivity);
        self.set_tunings(params.kp, params.ki, params.kd, params.direction);
    }
}

/// Returns `false` until `sample_time_ms` has elapsed since `last`, tolerating
/// wrap of the millisecond counter.
pub(crate) fn sample_due(last: Option<u32>, now_ms: u32, sample_time_ms: u16) -> bool {
    match last {
        Some(last) => now_ms.wrapping_sub(last) >= u32::from(sample_time_ms),
        None => true,
    }
}
