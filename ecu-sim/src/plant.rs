use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    /// Boost above baro with the wastegate held fully shut at full spool.
    pub boost_max_kpa: f64,
    /// Boost the wastegate spring alone allows, as a fraction of the maximum.
    pub boost_spring_fraction: f64,
    pub spool_start_rpm: f64,
    pub spool_full_rpm: f64,
    pub boost_time_constant_ms: f64,
    pub cam_rest_deg: f64,
    pub cam_max_deg: f64,
    /// Phaser speed at full duty away from the hold point.
    pub cam_slew_deg_per_s: f64,
    /// Duty at which the phaser holds position.
    pub cam_hold_duty: f64,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            boost_max_kpa: 140.0,
            boost_spring_fraction: 0.35,
            spool_start_rpm: 2000.0,
            spool_full_rpm: 4000.0,
            boost_time_constant_ms: 250.0,
            cam_rest_deg: 2.0,
            cam_max_deg: 50.0,
            cam_slew_deg_per_s: 150.0,
            cam_hold_duty: 0.5,
        }
    }
}

/// First-order turbo and wastegate model.
#[derive(Debug, Clone)]
pub struct BoostPlant {
    map_kpa: f64,
}

impl BoostPlant {
    pub fn new(baro_kpa: u16) -> Self {
        Self {
            map_kpa: f64::from(baro_kpa) * 0.4,
        }
    }

    pub fn map_kpa(&self) -> u16 {
        self.map_kpa.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }

    /// Advances by `dt_ms` with the solenoid at `duty` (0 to 1).
    pub fn step(&mut self, config: &PlantConfig, dt_ms: f64, duty: f64, rpm: u16, tps: u8, baro_kpa: u16) -> u16 {
        let baro = f64::from(baro_kpa);
        let throttle = f64::from(tps) / 200.0;
        let span = (config.spool_full_rpm - config.spool_start_rpm).max(1.0);
        let spool = ((f64::from(rpm) - config.spool_start_rpm) / span).clamp(0.0, 1.0);

        let gate = config.boost_spring_fraction + (1.0 - config.boost_spring_fraction) * duty.clamp(0.0, 1.0);
        // Vacuum at closed throttle, boost with load
        let equilibrium = baro * (0.3 + 0.7 * throttle) + config.boost_max_kpa * spool * gate * throttle;

        let alpha = (dt_ms / config.boost_time_constant_ms.max(1.0)).min(1.0);
        self.map_kpa += (equilibrium - self.map_kpa) * alpha;
        self.map_kpa()
    }
}

/// Oil-pressure cam phaser: advances above the hold duty, retards below it.
#[derive(Debug, Clone)]
pub struct CamPhaser {
    angle: f64,
}

impl CamPhaser {
    pub fn new(config: &PlantConfig) -> Self {
        Self {
            angle: config.cam_rest_deg,
        }
    }

    pub fn angle(&self) -> i16 {
        self.angle.round() as i16
    }

    pub fn step(&mut self, config: &PlantConfig, dt_ms: f64, duty: f64, running: bool) -> i16 {
        if running {
            let drive = (duty.clamp(0.0, 1.0) - config.cam_hold_duty) * 2.0;
            self.angle += drive * config.cam_slew_deg_per_s * dt_ms / 1000.0;
        } else {
            self.angle = config.cam_rest_deg;
        }
        self.angle = self.angle.clamp(config.cam_rest_deg, config.cam_max_deg);
        self.angle()
    }
}
