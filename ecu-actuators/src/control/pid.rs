use core::num::NonZeroU16;

use super::{DEFAULT_SAMPLE_TIME, Direction, PIDController, PIDMode, PIDParams, Proportional, sample_due};
use crate::fixed::{Fixed, non_zero};

/// Parallel-form integer PID.
///
/// The integral store holds the integral term already multiplied by `ki`, so
/// changing `ki` at runtime does not bump the output. It is kept inside
/// `[min_output - feed_forward, max_output - feed_forward]` at every step.
/// The derivative acts on the measurement only.
///
/// Until the first computation (or a manual output) there is no output to
/// continue from, so limits and `initialize` leave the store at zero and the
/// first output sits on the feed-forward.
#[derive(Debug, Clone)]
pub struct StandardPID {
    kp_user: u16,
    ki_user: u16,
    kd_user: u16,
    direction: Direction,
    kp: Fixed,
    ki: Fixed,
    kd: Fixed,
    sample_time: NonZeroU16,
    min_output: i32,
    max_output: i32,
    mode: PIDMode,
    // Q16
    integral: i64,
    last_input: i32,
    last_output: i32,
    last_feed_forward: i32,
    last_time: Option<u32>,
    primed: bool,
    // last_output holds a real output
    tracking: bool,
}

impl StandardPID {
    fn rescale(&mut self) {
        let sample = u32::from(self.sample_time.get());
        let kp = Fixed::from_ratio(i64::from(self.kp_user), non_zero(100));
        let ki = Fixed::from_ratio(i64::from(self.ki_user) * i64::from(sample), non_zero(100_000));
        let kd = Fixed::from_ratio(i64::from(self.kd_user) * 1000, non_zero(100 * sample));

        (self.kp, self.ki, self.kd) = match self.direction {
            Direction::Direct => (kp, ki, kd),
            Direction::Reverse => (-kp, -ki, -kd),
        };
    }

    fn integral_bounds(&self, feed_forward: i32) -> (i64, i64) {
        let ff = i64::from(feed_forward);
        (
            Fixed::upscale(i64::from(self.min_output) - ff),
            Fixed::upscale(i64::from(self.max_output) - ff),
        )
    }

    fn clamp_output(&self, value: i64) -> i32 {
        value.clamp(i64::from(self.min_output), i64::from(self.max_output)) as i32
    }
}

impl PIDController for StandardPID {
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
            sample_time: DEFAULT_SAMPLE_TIME,
            min_output: defaults.min_output,
            max_output: defaults.max_output,
            mode: PIDMode::Automatic,
            integral: 0,
            last_input: 0,
            last_output: 0,
            last_feed_forward: 0,
            last_time: None,
            primed: false,
            tracking: false,
        };
        pid.apply(params);
        pid
    }

    fn set_output_limits(&mut self, min: i32, max: i32) {
        if min >= max {
            log::warn!("Ignoring PID output limits {} >= {}", min, max);
            return;
        }
        if (min, max) == (self.min_output, self.max_output) {
            return;
        }

        self.min_output = min;
        self.max_output = max;

        if self.mode == PIDMode::Automatic && self.tracking {
            self.last_output = self.last_output.clamp(min, max);
            let (lo, hi) = self.integral_bounds(self.last_feed_forward);
            self.integral = self.integral.clamp(lo, hi);
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
        self.rescale();
    }

    fn set_sample_time(&mut self, sample_time_ms: u16) {
        let Some(sample_time) = NonZeroU16::new(sample_time_ms) else {
            log::warn!("Ignoring zero PID sample time");
            return;
        };
        if sample_time != self.sample_time {
            self.sample_time = sample_time;
            self.rescale();
        }
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
            self.tracking = true;
        }
    }

    /// Loads the integral store so the next output continues from the last
    /// one, and skips the derivative on the next step.
    fn initialize(&mut self) {
        self.integral = if self.tracking {
            let held = i64::from(self.last_output.clamp(self.min_output, self.max_output));
            let (lo, hi) = self.integral_bounds(self.last_feed_forward);
            Fixed::upscale(held - i64::from(self.last_feed_forward)).clamp(lo, hi)
        } else {
            0
        };
        self.primed = false;
    }

    fn compute(
        &mut self,
        now_ms: u32,
        input: i32,
        setpoint: i32,
        proportional: Proportional,
        feed_forward: i32,
    ) -> Option<i32> {
        if self.mode == PIDMode::Manual || !sample_due(self.last_time, now_ms, self.sample_time.get()) {
            return None;
        }

        let error = i64::from(setpoint) - i64::from(input);
        let d_input = if self.primed {
            i64::from(input) - i64::from(self.last_input)
        } else {
            0
        };

        self.integral = self.integral.saturating_add(self.ki.mul_raw(error));
        let p_term = match proportional {
            Proportional::OnError => self.kp.mul_raw(error),
            Proportional::OnMeasurement => {
                self.integral = self.integral.saturating_sub(self.kp.mul_raw(d_input));
                0
            }
        };
        let (lo, hi) = self.integral_bounds(feed_forward);
        self.integral = self.integral.clamp(lo, hi);

        let raw = p_term
            .saturating_add(self.integral)
            .saturating_sub(self.kd.mul_raw(d_input));
        let output = self.clamp_output(Fixed::descale(raw) + i64::from(feed_forward));

        self.last_input = input;
        self.last_output = output;
        self.last_feed_forward = feed_forward;
        self.last_time = Some(now_ms);
        self.primed = true;
        self.tracking = true;

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
            sensitivity: 0,
        }
    }
}
