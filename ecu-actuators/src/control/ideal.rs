use core::num::NonZeroU16;

use super::{DEFAULT_SAMPLE_TIME, Direction, PIDController, PIDMode, PIDParams, Proportional, sample_due};
use crate::fixed::{Fixed, non_zero};

pub const MAX_SENSITIVITY: u16 = 5000;

/// Integer PID in ideal form, centred on a bias output.
///
/// Input and setpoint are first compressed into a dimensionless range by
/// `value * 10000 / (10001 - 2 * sensitivity)`. The output is
/// `bias + kp*e + ki*sum(e) + kd*(e - e_prev)`, with the bias supplied as the
/// feed-forward argument of [`PIDController::compute`]. The error sum is
/// clamped separately above and below the bias so that `ki * sum(e)` can
/// reach the output limits but never pass them.
///
/// Proportional action is always on error.
#[derive(Debug, Clone)]
pub struct IdealPID {
    kp_user: u16,
    ki_user: u16,
    kd_user: u16,
    direction: Direction,
    kp: Fixed,
    ki: Fixed,
    kd: Fixed,
    sensitivity: u16,
    sample_time: NonZeroU16,
    min_output: i32,
    max_output: i32,
    mode: PIDMode,
    integral: i64,
    last_error: i64,
    last_output: i32,
    last_time: Option<u32>,
}

impl IdealPID {
    pub fn sensitivity(&self) -> u16 {
        self.sensitivity
    }

    fn unitless(&self, value: i32) -> i64 {
        // sensitivity <= 5000 keeps the divisor at 1 or more
        let divisor = 10_001 - 2 * i64::from(self.sensitivity);
        i64::from(value) * 10_000 / divisor
    }

    /// Error-sum range that keeps `ki * integral` inside the output limits
    /// around `bias`.
    fn integral_bounds(&self, bias: i32) -> (i64, i64) {
        let ki = i64::from(self.ki.to_bits());
        if ki == 0 {
            return (0, 0);
        }
        let headroom = Fixed::upscale((i64::from(self.max_output) - i64::from(bias)).max(0));
        let footroom = Fixed::upscale((i64::from(bias) - i64::from(self.min_output)).max(0));
        let magnitude = ki.abs();
        if ki > 0 {
            (-footroom / magnitude, headroom / magnitude)
        } else {
            (-headroom / magnitude, footroom / magnitude)
        }
    }
}

impl PIDController for IdealPID {
    fn new(params: &PIDParams) -> Self {
        let defaults = PIDParams::default();
        let mut pid = Self {
            kp_user: 0,
            ki_user: 0,
            kd_user: 0,
            direction: Direction::Direct,
            kp: Fixed::ZERO,
            ki: Fixed::ZERO,
            kd: Fixed::ZERO,
            sensitivity: 0,
            sample_time: DEFAULT_SAMPLE_TIME,
            min_output: defaults.min_output,
            max_output: defaults.max_output,
            mode: PIDMode::Automatic,
            integral: 0,
            last_error: 0,
            last_output: 0,
            last_time: None,
        };
        pid.apply(params);
        pid
    }

    fn set_output_limits(&mut self, min: i32, max: i32) {
        if min >= max {
            log::warn!("Ignoring PID output limits {} >= {}", min, max);
            return;
        }
        self.min_output = min;
        self.max_output = max;
        if self.mode == PIDMode::Automatic {
            self.last_output = self.last_output.clamp(min, max);
        }
    }

    fn set_tunings(&mut self, kp: u16, ki: u16, kd: u16, direction: Direction) {
        if (kp, ki, kd, direction) == (self.kp_user, self.ki_user, self.kd_user, self.direction) {
            return;
        }

        self.kp_user = kp;
        self.ki_user = ki;
        self.kd_user = kd;
        self.direction = direction;

        let tenths = non_zero(10);
        let kp = Fixed::from_ratio(i64::from(kp), tenths);
        let ki = Fixed::from_ratio(i64::from(ki), tenths);
        let kd = Fixed::from_ratio(i64::from(kd), tenths);
        (self.kp, self.ki, self.kd) = match direction {
            Direction::Direct => (kp, ki, kd),
            Direction::Reverse => (-kp, -ki, -kd),
        };
    }

    /// Gains are per sample, so only the rate limit changes.
    fn set_sample_time(&mut self, sample_time_ms: u16) {
        match NonZeroU16::new(sample_time_ms) {
            Some(sample_time) => self.sample_time = sample_time,
            None => log::warn!("Ignoring zero PID sample time"),
        }
    }

    fn set_sensitivity(&mut self, sensitivity: u16) {
        self.sensitivity = sensitivity.min(MAX_SENSITIVITY);
    }

    fn set_mode(&mut self, mode: PIDMode) {
        if self.mode == PIDMode::Manual && mode == PIDMode::Automatic {
            self.initialize();
        }
        self.mode = mode;
    }

    fn set_manual_output(&mut self, output: i32) {
        if self.mode == PIDMode::Manual {
            self.last_output = output.clamp(self.min_output, self.max_output);
        }
    }

    /// Drops the error history; the output restarts from the bias.
    fn initialize(&mut self) {
        self.integral = 0;
        self.last_error = 0;
    }

    fn compute(
        &mut self,
        now_ms: u32,
        input: i32,
        setpoint: i32,
        _proportional: Proportional,
        feed_forward: i32,
    ) -> Option<i32> {
        if self.mode == PIDMode::Manual || !sample_due(self.last_time, now_ms, self.sample_time.get()) {
            return None;
        }

        let error = self.unitless(setpoint) - self.unitless(input);

        let (lo, hi) = self.integral_bounds(feed_forward);
        self.integral = self.integral.saturating_add(error).clamp(lo, hi);

        let raw = self
            .kp
            .mul_raw(error)
            .saturating_add(self.ki.mul_raw(self.integral))
            .saturating_add(self.kd.mul_raw(error - self.last_error));
        let output = (i64::from(feed_forward) + Fixed::descale(raw))
            .clamp(i64::from(self.min_output), i64::from(self.max_output)) as i32;

        self.last_error = error;
        self.last_output = output;
        self.last_time = Some(now_ms);

        Some(output)
    }

    fn output_limits(&self) -> (i32, i32) {
        (self.min_output, self.max_output)
    }

    fn last_output(&self) -> i32 {
        self.last_output
    }

    fn mode(&self) -> PIDMode {
        self.mode
    }

    fn params(&self) -> PIDParams {
        PIDParams {
            kp: self.kp_user,
            ki: self.ki_user,
            kd: self.kd_user,
            direction: self.direction,
            min_output: self.min_output,
            max_output: self.max_output,
            sample_time_ms: self.sample_time.get(),
            sensitivity: self.sensitivity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kp: u16, ki: u16, kd: u16) -> PIDParams {
        PIDParams {
            kp,
            ki,
            kd,
            direction: Direction::Direct,
            min_output: 2000,
            max_output: 8000,
            sample_time_ms: 100,
            sensitivity: 0,
        }
    }

    #[test]
    fn test_ideal_pid_starts_from_bias() {
        let mut pid = IdealPID::new(&params(10, 0, 0));
        // Zero error leaves the output on the bias
        assert_eq!(pid.compute(0, 150, 150, Proportional::OnError, 5000), Some(5000));
        // kp 1.0 over an unscaled error of 100 units
        assert_eq!(pid.compute(100, 150, 250, Proportional::OnError, 5000), Some(5100));
    }

    #[test]
    fn test_ideal_pid_sensitivity_scales_error() {
        let mut pid = IdealPID::new(&PIDParams {
            sensitivity: 5000,
            ..params(10, 0, 0)
        });
        assert_eq!(pid.compute(0, 0, 1, Proportional::OnError, 5000), Some(8000));

        pid.set_sensitivity(9000);
        assert_eq!(pid.sensitivity(), MAX_SENSITIVITY);
    }

    #[test]
    fn test_ideal_pid_integral_clamped_around_bias() {
        let mut pid = IdealPID::new(&params(0, 10, 0));

        for step in 0..50u32 {
            let out = pid.compute(step * 100, 0, 1000, Proportional::OnError, 5000);
            assert!(matches!(out, Some(v) if (2000..=8000).contains(&v)));
        }
        assert_eq!(pid.last_output(), 8000);

        // A wound-up sum would need many steps to leave the limit
        let out = pid.compute(5000, 1000, 0, Proportional::OnError, 5000);
        assert!(out.is_some_and(|v| v < 8000), "integral must unwind immediately: {:?}", out);
    }

    #[test]
    fn test_ideal_pid_reverse_direction() {
        let mut pid = IdealPID::new(&PIDParams {
            direction: Direction::Reverse,
            ..params(10, 10, 0)
        });
        let out = pid.compute(0, 0, 500, Proportional::OnError, 5000);
        assert!(out.is_some_and(|v| v < 5000));

        for step in 1..50u32 {
            pid.compute(step * 100, 0, 5000, Proportional::OnError, 5000);
        }
        assert_eq!(pid.last_output(), 2000);
    }

    #[test]
    fn test_ideal_pid_initialize_resets_history() {
        let mut pid = IdealPID::new(&params(0, 10, 0));
        pid.compute(0, 0, 400, Proportional::OnError, 5000);
        pid.compute(100, 0, 400, Proportional::OnError, 5000);
        assert_eq!(pid.last_output(), 5798);

        pid.initialize();
        assert_eq!(pid.compute(200, 400, 400, Proportional::OnError, 5000), Some(5000));
    }

    #[test]
    fn test_ideal_pid_extreme_inputs_saturate() {
        let mut pid = IdealPID::new(&PIDParams {
            sensitivity: MAX_SENSITIVITY,
            ..params(u16::MAX, u16::MAX, u16::MAX)
        });

        assert_eq!(pid.compute(0, 0, 3_000_000, Proportional::OnError, 5000), Some(8000));
        assert_eq!(pid.compute(100, i32::MAX, i32::MIN, Proportional::OnError, 5000), Some(2000));
        assert_eq!(pid.compute(200, i32::MIN, i32::MAX, Proportional::OnError, 5000), Some(8000));
    }

    #[test]
    fn test_ideal_pid_rate_limited_and_manual() {
        let mut pid = IdealPID::new(&params(10, 0, 0));
        assert!(pid.compute(0, 0, 0, Proportional::OnError, 5000).is_some());
        assert!(pid.compute(99, 0, 0, Proportional::OnError, 5000).is_none());

        pid.set_mode(PIDMode::Manual);
        assert!(pid.compute(200, 0, 0, Proportional::OnError, 5000).is_none());
        pid.set_mode(PIDMode::Automatic);
        assert!(pid.compute(300, 0, 0, Proportional::OnError, 5000).is_some());
    }
}
