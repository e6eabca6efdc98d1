use std::env;
use std::path::Path;

use ecu_actuators::{BoostConfig, PwmConfig, Table, TargetLookup, VvtConfig};
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::plant::PlantConfig;

/// Environment variable naming a settings file to use instead of the
/// built-in defaults.
pub const CONFIG_ENV: &str = "ECU_SIM_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub duration_ms: u32,
    pub control_interval_ms: u32,
    /// Pace control ticks against the wall clock.
    #[serde(default)]
    pub realtime: bool,
    /// Keep one trace sample every this many control ticks.
    pub sample_every: u32,
    /// Write the JSON report here instead of stdout.
    #[serde(default)]
    pub report: Option<String>,
    pub boost_pwm: PwmConfig,
    pub vvt_pwm: PwmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start_ms: u32,
    pub end_ms: u32,
}

impl Window {
    pub fn contains(&self, t_ms: u32) -> bool {
        (self.start_ms..self.end_ms).contains(&t_ms)
    }
}

/// Driving scenario: an rpm ramp at fixed throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub baro_kpa: u16,
    pub idle_rpm: u16,
    pub max_rpm: u16,
    pub ramp_ms: u32,
    pub tps: u8,
    pub coolant_c: i16,
    #[serde(default)]
    pub gear: u8,
    #[serde(default)]
    pub ethanol_pct: u8,
    /// Cam sensors report nothing during this window.
    #[serde(default)]
    pub cam_dropout: Option<Window>,
    /// Which cams drop out.
    #[serde(default = "both_cams")]
    pub dropout_cams: [bool; 2],
}

fn both_cams() -> [bool; 2] {
    [true, true]
}

impl Profile {
    /// Cam angles as the sensors report them at `t_ms`.
    pub fn cam_reading(&self, t_ms: u32, angles: [i16; 2]) -> [i16; 2] {
        let dropout = self.cam_dropout.is_some_and(|w| w.contains(t_ms));
        let mut reading = angles;
        for (angle, drops) in reading.iter_mut().zip(self.dropout_cams) {
            if dropout && drops {
                *angle = 0;
            }
        }
        reading
    }

    pub fn rpm_at(&self, t_ms: u32) -> u16 {
        if self.ramp_ms == 0 || t_ms >= self.ramp_ms {
            return self.max_rpm;
        }
        let span = i64::from(self.max_rpm) - i64::from(self.idle_rpm);
        let rpm = i64::from(self.idle_rpm) + span * i64::from(t_ms) / i64::from(self.ramp_ms);
        rpm.clamp(0, i64::from(u16::MAX)) as u16
    }
}

/// Piecewise-linear curve over rpm (target kPa for feed-forward, ethanol
/// percent for flex boost).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Curve(pub Vec<(u16, u16)>);

impl Curve {
    pub fn at(&self, x: u16) -> u16 {
        let points = &self.0;
        let Some(&(first_x, first_y)) = points.first() else {
            return 0;
        };
        if x <= first_x {
            return first_y;
        }
        for pair in points.windows(2) {
            let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
            if x <= x1 {
                if x1 == x0 {
                    return y1;
                }
                let (x, x0, x1, y0, y1) = (i64::from(x), i64::from(x0), i64::from(x1), i64::from(y0), i64::from(y1));
                return (y0 + (y1 - y0) * (x - x0) / (x1 - x0)) as u16;
            }
        }
        points.last().map_or(0, |&(_, y)| y)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub boost_duty: Curve,
    pub boost_target: Curve,
    pub boost_feed_forward: Curve,
    pub flex_boost: Curve,
    pub vvt1: Curve,
    pub vvt2: Curve,
}

impl TargetLookup for Tables {
    fn lookup(&self, table: Table, load: u16, rpm: u16) -> u16 {
        match table {
            Table::BoostDuty => self.boost_duty.at(rpm),
            Table::BoostTarget => self.boost_target.at(rpm),
            Table::BoostFeedForward => self.boost_feed_forward.at(load),
            Table::FlexBoost => self.flex_boost.at(load),
            Table::Vvt1 => self.vvt1.at(rpm),
            Table::Vvt2 => self.vvt2.at(rpm),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub logger: Logger,
    pub simulation: Simulation,
    pub profile: Profile,
    #[serde(default)]
    pub plant: PlantConfig,
    pub tables: Tables,
    pub boost: BoostConfig,
    pub vvt: VvtConfig,
}

impl Settings {
    /// Built-in defaults, or the file named by `ECU_SIM_CONFIG`.
    pub fn new() -> Result<Self, SimError> {
        match env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => Self::from_toml(include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../",
                "configs/default.toml"
            ))),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SimError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SimError> {
        let sim = &self.simulation;
        if sim.control_interval_ms == 0 || sim.sample_every == 0 {
            return Err(SimError::Settings(
                "control_interval_ms and sample_every must be non-zero".into(),
            ));
        }
        for pwm in [&sim.boost_pwm, &sim.vvt_pwm] {
            let total = u64::from(pwm.timer_hz) * u64::from(sim.duration_ms) / 1000;
            if total >= u64::from(u32::MAX) {
                return Err(SimError::Settings(format!(
                    "{} ms at {} Hz overflows the tick counter",
                    sim.duration_ms, pwm.timer_hz
                )));
            }
        }
        if sim.boost_pwm.timer_hz != sim.vvt_pwm.timer_hz {
            return Err(SimError::Settings("boost and VVT timers must share one tick rate".into()));
        }
        if sim.boost_pwm.timer_hz < 1000 {
            return Err(SimError::Settings("timer_hz must be at least 1 kHz".into()));
        }
        self.boost.validate()?;
        self.vvt.validate()?;
        Ok(())
    }
}
