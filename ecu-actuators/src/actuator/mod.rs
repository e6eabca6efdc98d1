mod boost;
mod vvt;

pub use boost::*;
pub use vvt::*;

use serde::{Deserialize, Serialize};

use crate::pwm::{ChannelId, DutyCycle, DutySink};

/// Highest valid throttle reading, in half-percent.
pub const TPS_FULL: u8 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    #[default]
    Disabled,
    WarmupHold,
    ActiveOpenLoop,
    ActiveClosedLoop,
    Fault,
}

/// Sensor snapshot taken once per control tick, already in engineering units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineInputs {
    pub rpm: u16,
    pub map_kpa: u16,
    pub baro_kpa: u16,
    /// Throttle position in half-percent, `0..=200`.
    pub tps: u8,
    pub coolant_c: i16,
    /// Measured cam advance per bank, degrees.
    pub cam_angle: [i16; 2],
    pub running: bool,
    /// Engaged gear, 0 when in neutral or unknown.
    pub gear: u8,
    /// Ethanol content of the fuel, percent.
    pub ethanol_pct: u8,
}

/// Curves the control loops read through [`TargetLookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Open-loop boost duty, half-percent.
    BoostDuty,
    /// Closed-loop boost target, kPa.
    BoostTarget,
    /// Expected duty for a boost target, half-percent. Indexed by target kPa.
    BoostFeedForward,
    /// Cam 1 duty (half-percent) or target angle (degrees), by VVT mode.
    Vvt1,
    Vvt2,
    /// Boost target adder, kPa. Indexed by ethanol percent.
    FlexBoost,
}

/// Curve interpolation provided by the host firmware.
pub trait TargetLookup {
    fn lookup(&self, table: Table, load: u16, rpm: u16) -> u16;
}

/// Snapshot of a control loop for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorStatus {
    pub state: ActuatorState,
    pub duty: [DutyCycle; 2],
    /// Raised while the channel's feedback is out of range.
    pub fault: [bool; 2],
    /// Last closed-loop target, in the loop's feedback units.
    pub target: [i32; 2],
}

/// Periodic task driving one actuator.
pub trait ControlLoop {
    /// Runs one control step and hands the resulting duty to `sink`.
    fn tick<L: TargetLookup, S: DutySink>(&mut self, now_ms: u32, inputs: &EngineInputs, tables: &L, sink: &S) -> ActuatorState;

    fn status(&self) -> &ActuatorStatus;
}

/// Holds an actuator off for a delay after its enable conditions first hold.
///
/// Once the delay has passed the gate stays open until the engine stops,
/// even if the conditions drop out for a while.
#[derive(Debug, Clone)]
pub struct WarmupGate {
    delay_ms: u32,
    started_at: Option<u32>,
    hot: bool,
}

impl WarmupGate {
    pub fn new(delay_ms: u32) -> Self {
        Self {
            delay_ms,
            started_at: None,
            hot: false,
        }
    }

    pub fn set_delay(&mut self, delay_ms: u32) {
        self.delay_ms = delay_ms;
    }

    pub fn is_hot(&self) -> bool {
        self.hot
    }

    /// Returns `true` when the actuator may run.
    pub fn update(&mut self, now_ms: u32, conditions_met: bool, running: bool) -> bool {
        if !running {
            self.hot = false;
        }
        if !conditions_met {
            self.started_at = None;
            return false;
        }

        let started_at = *self.started_at.get_or_insert(now_ms);
        if !self.hot && now_ms.wrapping_sub(started_at) >= self.delay_ms {
            log::debug!("Warm-up delay of {} ms elapsed", self.delay_ms);
            self.hot = true;
        }
        self.hot
    }
}

/// Pushes a duty to the PWM side. A rejected channel is a wiring error that
/// must not stop the loop, so it is only logged.
fn publish<S: DutySink>(sink: &S, channel: ChannelId, duty: DutyCycle) {
    if let Err(e) = sink.set_duty(channel, duty) {
        log::warn!("Failed to set {:?} duty: {}", channel, e);
    }
}

fn log_transition(name: &str, from: ActuatorState, to: ActuatorState) {
    if from == to {
        return;
    }
    if to == ActuatorState::Fault {
        log::warn!("{} feedback out of range, output forced off", name);
    } else {
        log::debug!("{} state {:?} -> {:?}", name, from, to);
    }
}
