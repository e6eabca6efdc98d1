use serde::{Deserialize, Serialize};

use super::{
    ActuatorState, ActuatorStatus, ControlLoop, EngineInputs, TPS_FULL, Table, TargetLookup, log_transition, publish,
};
use crate::control::{IdealPID, PIDController, PIDParams, Proportional};
use crate::error::{Error, Result};
use crate::pwm::{ChannelId, DUTY_FULL_SCALE, DutyCycle, DutySink};

/// Gains used when the tune asks for the simple boost mode.
pub const SIMPLE_BOOST_GAINS: (u16, u16, u16) = (1, 1, 1);

/// Ceiling for the closed-loop target after gear and flex adjustments.
pub const MAX_BOOST_TARGET_KPA: u16 = 511;

pub const GEAR_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostMode {
    /// Duty straight from the boost duty table.
    OpenLoop,
    #[default]
    ClosedLoop,
}

/// Manifold pressure at which closed-loop control takes over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostThreshold {
    /// Once the engine is making boost.
    #[default]
    Baro,
    Fixed { kpa: u16 },
}

/// Per-gear override of the boost table, for gears 1 to 6.
///
/// In open loop the value is a duty in half-percent; in closed loop it is a
/// target in kPa. Gear 0 (neutral or unknown) always reads the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostByGear {
    #[default]
    Off,
    /// Scales the table value by a percentage per gear.
    Multiplier([u8; GEAR_COUNT]),
    /// Replaces the table value per gear.
    Fixed([u16; GEAR_COUNT]),
}

impl BoostByGear {
    pub fn adjust(&self, gear: u8, table_value: u16) -> u16 {
        let Some(slot) = usize::from(gear).checked_sub(1).filter(|&slot| slot < GEAR_COUNT) else {
            return table_value;
        };
        match self {
            BoostByGear::Off => table_value,
            BoostByGear::Multiplier(percent) => {
                let scaled = u32::from(table_value) * u32::from(percent[slot]) / 100;
                u16::try_from(scaled).unwrap_or(u16::MAX)
            }
            BoostByGear::Fixed(values) => values[slot],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub enabled: bool,
    pub mode: BoostMode,
    pub channel: ChannelId,
    /// Ignore `pid` gains and run with [`SIMPLE_BOOST_GAINS`].
    pub simple_tunings: bool,
    /// Output limits are in duty units.
    pub pid: PIDParams,
    pub threshold: BoostThreshold,
    /// Duty below the threshold, usually high to keep the wastegate shut.
    pub duty_when_below_threshold: DutyCycle,
    /// Centre of the controller output when no feed-forward table is used.
    pub bias: DutyCycle,
    pub feed_forward_table: bool,
    pub by_gear: BoostByGear,
    /// Add the flex boost curve (kPa by ethanol percent) to the target.
    pub flex_enabled: bool,
    /// Plausible MAP sensor range.
    pub map_min_kpa: u16,
    pub map_max_kpa: u16,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: BoostMode::ClosedLoop,
            channel: ChannelId::A,
            simple_tunings: false,
            pid: PIDParams {
                kp: 20,
                ki: 5,
                kd: 2,
                min_output: 2000,
                max_output: 8000,
                sample_time_ms: 50,
                sensitivity: 0,
                ..PIDParams::default()
            },
            threshold: BoostThreshold::Baro,
            duty_when_below_threshold: DutyCycle::from_percent(80),
            bias: DutyCycle::from_percent(50),
            feed_forward_table: false,
            by_gear: BoostByGear::Off,
            flex_enabled: false,
            map_min_kpa: 10,
            map_max_kpa: 400,
        }
    }
}

impl BoostConfig {
    pub fn validate(&self) -> Result<()> {
        let duty_range = 0..=i32::from(DUTY_FULL_SCALE);
        if self.pid.min_output >= self.pid.max_output
            || !duty_range.contains(&self.pid.min_output)
            || !duty_range.contains(&self.pid.max_output)
            || self.pid.sample_time_ms == 0
            || self.map_min_kpa >= self.map_max_kpa
        {
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }

    fn effective_params(&self) -> PIDParams {
        if self.simple_tunings {
            let (kp, ki, kd) = SIMPLE_BOOST_GAINS;
            PIDParams { kp, ki, kd, ..self.pid }
        } else {
            self.pid
        }
    }
}

/// Boost solenoid control.
///
/// Closed loop runs the ideal-form PID on MAP against the boost target table.
/// Below the activation threshold the controller is held reset and the
/// solenoid gets a fixed duty.
#[derive(Debug)]
pub struct BoostControl<P: PIDController = IdealPID> {
    config: BoostConfig,
    pid: P,
    status: ActuatorStatus,
    flex_correction: u16,
}

impl<P: PIDController> BoostControl<P> {
    pub fn new(config: BoostConfig) -> Result<Self> {
        config.validate()?;
        let pid = P::new(&config.effective_params());
        Ok(Self {
            config,
            pid,
            status: ActuatorStatus::default(),
            flex_correction: 0,
        })
    }

    pub fn config(&self) -> &BoostConfig {
        &self.config
    }

    /// Swaps in a new tune. An invalid one is rejected and the current tune
    /// stays active.
    pub fn set_config(&mut self, config: BoostConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            log::warn!("Rejected boost configuration: {}", e);
            return Err(e);
        }
        self.config = config;
        Ok(())
    }

    pub fn pid(&self) -> &P {
        &self.pid
    }

    /// kPa the flex curve added to the last target.
    pub fn flex_correction(&self) -> u16 {
        self.flex_correction
    }

    fn target<L: TargetLookup>(&mut self, inputs: &EngineInputs, tables: &L) -> u16 {
        let table = tables.lookup(Table::BoostTarget, u16::from(inputs.tps), inputs.rpm);
        let target = self.config.by_gear.adjust(inputs.gear, table);

        self.flex_correction = if self.config.flex_enabled {
            tables.lookup(Table::FlexBoost, u16::from(inputs.ethanol_pct), inputs.rpm)
        } else {
            0
        };
        target.saturating_add(self.flex_correction).min(MAX_BOOST_TARGET_KPA)
    }

    fn map_valid(&self, inputs: &EngineInputs) -> bool {
        (self.config.map_min_kpa..=self.config.map_max_kpa).contains(&inputs.map_kpa)
    }

    fn threshold_reached(&self, inputs: &EngineInputs) -> bool {
        match self.config.threshold {
            BoostThreshold::Baro => inputs.map_kpa >= inputs.baro_kpa,
            BoostThreshold::Fixed { kpa } => inputs.map_kpa >= kpa,
        }
    }

    fn decide<L: TargetLookup>(&mut self, now_ms: u32, inputs: &EngineInputs, tables: &L) -> (ActuatorState, DutyCycle) {
        if !self.config.enabled {
            self.flex_correction = 0;
            return (ActuatorState::Disabled, DutyCycle::OFF);
        }
        if inputs.tps > TPS_FULL {
            return (ActuatorState::Fault, DutyCycle::OFF);
        }

        match self.config.mode {
            BoostMode::OpenLoop => {
                self.flex_correction = 0;
                let table = tables.lookup(Table::BoostDuty, u16::from(inputs.tps), inputs.rpm);
                let duty = DutyCycle::from_half_percent(self.config.by_gear.adjust(inputs.gear, table));
                (ActuatorState::ActiveOpenLoop, duty)
            }
            BoostMode::ClosedLoop => {
                if !self.map_valid(inputs) {
                    return (ActuatorState::Fault, DutyCycle::OFF);
                }

                let target = self.target(inputs, tables);
                self.status.target[self.config.channel.index()] = i32::from(target);

                if !self.threshold_reached(inputs) {
                    self.pid.initialize();
                    return (ActuatorState::ActiveOpenLoop, self.config.duty_when_below_threshold);
                }
                if target == 0 {
                    self.pid.initialize();
                    return (ActuatorState::ActiveClosedLoop, DutyCycle::OFF);
                }

                self.pid.apply(&self.config.effective_params());
                let feed_forward = if self.config.feed_forward_table {
                    DutyCycle::from_half_percent(tables.lookup(Table::BoostFeedForward, target, inputs.rpm))
                } else {
                    self.config.bias
                };

                let duty = match self.pid.compute(
                    now_ms,
                    i32::from(inputs.map_kpa),
                    i32::from(target),
                    Proportional::OnError,
                    i32::from(feed_forward.raw()),
                ) {
                    Some(output) => DutyCycle::from_output(output),
                    None => self.status.duty[self.config.channel.index()],
                };
                (ActuatorState::ActiveClosedLoop, duty)
            }
        }
    }
}

impl<P: PIDController> ControlLoop for BoostControl<P> {
    fn tick<L: TargetLookup, S: DutySink>(&mut self, now_ms: u32, inputs: &EngineInputs, tables: &L, sink: &S) -> ActuatorState {
        let (state, duty) = self.decide(now_ms, inputs, tables);
        log_transition("Boost", self.status.state, state);

        let index = self.config.channel.index();
        self.status.state = state;
        self.status.duty[index] = duty;
        self.status.fault[index] = state == ActuatorState::Fault;
        publish(sink, self.config.channel, duty);
        state
    }

    fn status(&self) -> &ActuatorStatus {
        &self.status
    }
}
