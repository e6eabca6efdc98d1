use serde::{Deserialize, Serialize};

use super::{
    ActuatorState, ActuatorStatus, ControlLoop, EngineInputs, TPS_FULL, Table, TargetLookup, WarmupGate, log_transition,
    publish,
};
use crate::control::{Direction, PIDController, PIDMode, PIDParams, Proportional, StandardPID};
use crate::error::{Error, Result};
use crate::pwm::{ChannelId, DUTY_FULL_SCALE, DutyCycle, DutySink};

/// Open-loop table values below this are treated as off in on/off mode.
pub const ON_OFF_THRESHOLD: u16 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VvtMode {
    OpenLoop,
    /// Open loop, but the solenoid is either fully on or off.
    OnOff,
    #[default]
    ClosedLoop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    #[default]
    Tps,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VvtConfig {
    pub enabled: bool,
    pub mode: VvtMode,
    /// Cam 2 on channel B.
    pub second_channel: bool,
    pub load_source: LoadSource,
    pub min_coolant_c: i16,
    /// Delay after the enable conditions first hold.
    pub warmup_delay_ms: u32,
    /// Gains shared by both cams. Output limits are in duty units.
    pub pid: PIDParams,
    pub direction: [Direction; 2],
    /// Fixed duty when a cam sits exactly on target.
    pub hold_duty: Option<DutyCycle>,
    /// Cam readings outside `(min_angle, max_angle]` are invalid.
    pub min_angle: i16,
    pub max_angle: i16,
}

impl Default for VvtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: VvtMode::ClosedLoop,
            second_channel: false,
            load_source: LoadSource::Tps,
            min_coolant_c: 60,
            warmup_delay_ms: 5000,
            pid: PIDParams {
                kp: 2000,
                ki: 4000,
                kd: 100,
                min_output: 0,
                max_output: 9000,
                sample_time_ms: 33,
                ..PIDParams::default()
            },
            direction: [Direction::Direct; 2],
            hold_duty: None,
            min_angle: 0,
            max_angle: 50,
        }
    }
}

impl VvtConfig {
    pub fn validate(&self) -> Result<()> {
        let duty_range = 0..=i32::from(DUTY_FULL_SCALE);
        if self.pid.min_output >= self.pid.max_output
            || !duty_range.contains(&self.pid.min_output)
            || !duty_range.contains(&self.pid.max_output)
            || self.pid.sample_time_ms == 0
            || self.min_angle >= self.max_angle
        {
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }

    fn channel_count(&self) -> usize {
        if self.second_channel { 2 } else { 1 }
    }

    fn params_for(&self, channel: ChannelId) -> PIDParams {
        PIDParams {
            direction: self.direction[channel.index()],
            ..self.pid
        }
    }
}

/// Variable cam timing control for one or two cams.
#[derive(Debug)]
pub struct VvtControl<P: PIDController = StandardPID> {
    config: VvtConfig,
    pids: [P; 2],
    warmup: WarmupGate,
    status: ActuatorStatus,
}

impl<P: PIDController> VvtControl<P> {
    pub fn new(config: VvtConfig) -> Result<Self> {
        config.validate()?;
        let pids = ChannelId::ALL.map(|channel| P::new(&config.params_for(channel)));
        Ok(Self {
            warmup: WarmupGate::new(config.warmup_delay_ms),
            config,
            pids,
            status: ActuatorStatus::default(),
        })
    }

    pub fn config(&self) -> &VvtConfig {
        &self.config
    }

    /// Swaps in a new tune. An invalid one is rejected and the current tune
    /// stays active.
    pub fn set_config(&mut self, config: VvtConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            log::warn!("Rejected VVT configuration: {}", e);
            return Err(e);
        }
        self.warmup.set_delay(config.warmup_delay_ms);
        self.config = config;
        Ok(())
    }

    pub fn pid(&self, channel: ChannelId) -> &P {
        &self.pids[channel.index()]
    }

    fn angle_valid(&self, angle: i16) -> bool {
        angle > self.config.min_angle && angle <= self.config.max_angle
    }

    fn load(&self, inputs: &EngineInputs) -> u16 {
        match self.config.load_source {
            LoadSource::Tps => u16::from(inputs.tps),
            LoadSource::Map => inputs.map_kpa,
        }
    }

    fn open_loop<L: TargetLookup>(&self, inputs: &EngineInputs, tables: &L, table: Table) -> DutyCycle {
        let raw = tables.lookup(table, self.load(inputs), inputs.rpm);
        if self.config.mode == VvtMode::OnOff && raw < ON_OFF_THRESHOLD {
            DutyCycle::OFF
        } else {
            DutyCycle::from_half_percent(raw)
        }
    }

    /// One cam in closed loop. Returns `None` when the cam reading is out of
    /// range.
    fn closed_loop<L: TargetLookup>(
        &mut self,
        now_ms: u32,
        inputs: &EngineInputs,
        tables: &L,
        channel: ChannelId,
        table: Table,
    ) -> Option<DutyCycle> {
        let index = channel.index();
        let target = i32::from(tables.lookup(table, self.load(inputs), inputs.rpm));
        self.status.target[index] = target;

        let angle = inputs.cam_angle[index];
        let valid = self.angle_valid(angle);

        let params = self.config.params_for(channel);
        let pid = &mut self.pids[index];
        pid.apply(&params);
        if !valid {
            return None;
        }

        if let Some(hold) = self.config.hold_duty {
            if target == i32::from(angle) {
                pid.initialize();
                return Some(hold);
            }
        }

        let duty = match pid.compute(now_ms, i32::from(angle), target, Proportional::OnMeasurement, 0) {
            Some(output) => DutyCycle::from_output(output),
            None => self.status.duty[index],
        };
        Some(duty)
    }

    fn decide<L: TargetLookup>(&mut self, now_ms: u32, inputs: &EngineInputs, tables: &L) -> (ActuatorState, [DutyCycle; 2]) {
        let off = [DutyCycle::OFF; 2];
        let conditions_met = self.config.enabled && inputs.running && inputs.coolant_c >= self.config.min_coolant_c;
        if !self.warmup.update(now_ms, conditions_met, inputs.running) {
            // Solenoids are off; the controllers resume from there
            for pid in &mut self.pids {
                pid.set_mode(PIDMode::Manual);
                pid.set_manual_output(0);
            }
            self.status.fault = [false; 2];
            let state = if conditions_met {
                ActuatorState::WarmupHold
            } else {
                ActuatorState::Disabled
            };
            return (state, off);
        }
        for pid in &mut self.pids {
            pid.set_mode(PIDMode::Automatic);
        }

        if self.config.load_source == LoadSource::Tps && inputs.tps > TPS_FULL {
            self.status.fault = [true, self.config.second_channel];
            return (ActuatorState::Fault, off);
        }

        let tables_for = [Table::Vvt1, Table::Vvt2];
        let count = self.config.channel_count();
        match self.config.mode {
            VvtMode::OpenLoop | VvtMode::OnOff => {
                let mut duty = off;
                for (slot, table) in duty.iter_mut().zip(tables_for).take(count) {
                    *slot = self.open_loop(inputs, tables, table);
                }
                self.status.fault = [false; 2];
                (ActuatorState::ActiveOpenLoop, duty)
            }
            VvtMode::ClosedLoop => {
                let mut duty = off;
                let mut fault = [false; 2];
                for (channel, table) in ChannelId::ALL.into_iter().zip(tables_for).take(count) {
                    match self.closed_loop(now_ms, inputs, tables, channel, table) {
                        Some(d) => duty[channel.index()] = d,
                        None => fault[channel.index()] = true,
                    }
                }
                // A bad cam is switched off on its own; the other keeps running
                self.status.fault = fault;
                let state = if fault.contains(&true) {
                    ActuatorState::Fault
                } else {
                    ActuatorState::ActiveClosedLoop
                };
                (state, duty)
            }
        }
    }
}

impl<P: PIDController> ControlLoop for VvtControl<P> {
    fn tick<L: TargetLookup, S: DutySink>(&mut self, now_ms: u32, inputs: &EngineInputs, tables: &L, sink: &S) -> ActuatorState {
        let (state, duty) = self.decide(now_ms, inputs, tables);
        log_transition("VVT", self.status.state, state);

        self.status.state = state;
        self.status.duty = duty;
        for channel in ChannelId::ALL.into_iter().take(self.config.channel_count()) {
            publish(sink, channel, duty[channel.index()]);
        }
        state
    }

    fn status(&self) -> &ActuatorStatus {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::testing::{FlatTables, RecordingSink};

    fn inputs(cam: [i16; 2]) -> EngineInputs {
        EngineInputs {
            rpm: 3000,
            map_kpa: 90,
            baro_kpa: 100,
            tps: 80,
            coolant_c: 85,
            cam_angle: cam,
            running: true,
            ..EngineInputs::default()
        }
    }

    fn tables(vvt: [u16; 2]) -> FlatTables {
        FlatTables {
            vvt,
            ..FlatTables::default()
        }
    }

    fn config() -> VvtConfig {
        VvtConfig {
            warmup_delay_ms: 0,
            ..VvtConfig::default()
        }
    }

    #[test]
    fn test_vvt_disabled_when_cold_or_stopped() {
        let mut vvt: VvtControl = VvtControl::new(config()).unwrap();
        let sink = RecordingSink {
            single_channel: true,
            ..RecordingSink::default()
        };

        let cold = EngineInputs { coolant_c: 20, ..inputs([20, 0]) };
        assert_eq!(vvt.tick(0, &cold, &tables([25, 0]), &sink), ActuatorState::Disabled);
        assert_eq!(sink.get(ChannelId::A), Some(DutyCycle::OFF));

        let stopped = EngineInputs { running: false, ..inputs([20, 0]) };
        assert_eq!(vvt.tick(10, &stopped, &tables([25, 0]), &sink), ActuatorState::Disabled);
    }

    #[test]
    fn test_vvt_warmup_hold() {
        let mut vvt: VvtControl = VvtControl::new(VvtConfig {
            warmup_delay_ms: 2000,
            ..VvtConfig::default()
        })
        .unwrap();
        let sink = RecordingSink::default();

        assert_eq!(vvt.tick(0, &inputs([20, 0]), &tables([25, 0]), &sink), ActuatorState::WarmupHold);
        assert_eq!(vvt.tick(1999, &inputs([20, 0]), &tables([25, 0]), &sink), ActuatorState::WarmupHold);
        assert_eq!(sink.get(ChannelId::A), Some(DutyCycle::OFF));
        assert_eq!(vvt.tick(2000, &inputs([20, 0]), &tables([25, 0]), &sink), ActuatorState::ActiveClosedLoop);
    }

    #[test]
    fn test_vvt_closed_loop_drives_towards_target() {
        let mut vvt: VvtControl = VvtControl::new(config()).unwrap();
        let sink = RecordingSink::default();

        assert_eq!(vvt.tick(0, &inputs([20, 0]), &tables([25, 0]), &sink), ActuatorState::ActiveClosedLoop);
        let first = sink.get(ChannelId::A).unwrap();
        assert!(first > DutyCycle::OFF);
        assert_eq!(vvt.status().target[0], 25);

        // Integral keeps pushing while below target
        vvt.tick(33, &inputs([20, 0]), &tables([25, 0]), &sink);
        assert!(sink.get(ChannelId::A).unwrap() > first);
        // Second cam not configured
        assert_eq!(sink.get(ChannelId::B), None);
    }

    #[test]
    fn test_vvt_fault_forces_zero_same_tick() {
        let mut vvt: VvtControl = VvtControl::new(VvtConfig {
            second_channel: true,
            ..config()
        })
        .unwrap();
        let sink = RecordingSink::default();

        vvt.tick(0, &inputs([20, 20]), &tables([25, 25]), &sink);
        assert!(sink.get(ChannelId::A).unwrap() > DutyCycle::OFF);
        assert!(sink.get(ChannelId::B).unwrap() > DutyCycle::OFF);

        // Lower bound is exclusive; only the bad cam is switched off
        assert_eq!(vvt.tick(33, &inputs([0, 20]), &tables([25, 25]), &sink), ActuatorState::Fault);
        assert_eq!(sink.get(ChannelId::A), Some(DutyCycle::OFF));
        assert!(sink.get(ChannelId::B).unwrap() > DutyCycle::OFF);
        assert_eq!(vvt.status().fault, [true, false]);

        assert_eq!(vvt.tick(66, &inputs([20, 51]), &tables([25, 25]), &sink), ActuatorState::Fault);
        assert!(sink.get(ChannelId::A).unwrap() > DutyCycle::OFF);
        assert_eq!(sink.get(ChannelId::B), Some(DutyCycle::OFF));
        assert_eq!(vvt.status().fault, [false, true]);

        assert_eq!(vvt.tick(70, &inputs([-3, 60]), &tables([25, 25]), &sink), ActuatorState::Fault);
        assert_eq!(vvt.status().duty, [DutyCycle::OFF; 2]);

        // Upper bound is inclusive and the fault clears on its own
        assert_eq!(vvt.tick(99, &inputs([20, 50]), &tables([25, 25]), &sink), ActuatorState::ActiveClosedLoop);
        assert_eq!(vvt.status().fault, [false, false]);
    }

    #[test]
    fn test_vvt_restart_drops_old_integral() {
        let mut vvt: VvtControl = VvtControl::new(config()).unwrap();
        let sink = RecordingSink::default();

        // Cam stuck short of target winds the integral up
        for step in 0..100u32 {
            vvt.tick(step * 33, &inputs([5, 0]), &tables([40, 0]), &sink);
        }
        let wound = sink.get(ChannelId::A).unwrap();

        let stopped = EngineInputs { running: false, ..inputs([5, 0]) };
        assert_eq!(vvt.tick(4000, &stopped, &tables([40, 0]), &sink), ActuatorState::Disabled);
        assert_eq!(vvt.tick(5000, &inputs([35, 0]), &tables([40, 0]), &sink), ActuatorState::ActiveClosedLoop);
        let restarted = sink.get(ChannelId::A).unwrap();

        let mut fresh: VvtControl = VvtControl::new(config()).unwrap();
        fresh.tick(0, &inputs([35, 0]), &tables([40, 0]), &sink);
        assert_eq!(restarted, sink.get(ChannelId::A).unwrap());
        assert!(restarted < wound);
    }

    #[test]
    fn test_vvt_hold_duty_on_target() {
        let mut vvt: VvtControl = VvtControl::new(VvtConfig {
            hold_duty: Some(DutyCycle::from_percent(45)),
            ..config()
        })
        .unwrap();
        let sink = RecordingSink::default();

        vvt.tick(0, &inputs([25, 0]), &tables([25, 0]), &sink);
        assert_eq!(sink.get(ChannelId::A), Some(DutyCycle::from_percent(45)));
    }

    #[test]
    fn test_vvt_open_loop_and_on_off() {
        let mut vvt: VvtControl = VvtControl::new(VvtConfig {
            mode: VvtMode::OpenLoop,
            second_channel: true,
            ..config()
        })
        .unwrap();
        let sink = RecordingSink::default();

        assert_eq!(vvt.tick(0, &inputs([0, 0]), &tables([150, 60]), &sink), ActuatorState::ActiveOpenLoop);
        assert_eq!(sink.get(ChannelId::A), Some(DutyCycle::from_percent(75)));
        assert_eq!(sink.get(ChannelId::B), Some(DutyCycle::from_percent(30)));

        let mut on_off: VvtControl = VvtControl::new(VvtConfig {
            mode: VvtMode::OnOff,
            second_channel: true,
            ..config()
        })
        .unwrap();
        on_off.tick(0, &inputs([0, 0]), &tables([199, 200]), &sink);
        assert_eq!(sink.get(ChannelId::A), Some(DutyCycle::OFF));
        assert_eq!(sink.get(ChannelId::B), Some(DutyCycle::FULL));
    }

    #[test]
    fn test_vvt_reverse_direction_per_cam() {
        let mut vvt: VvtControl = VvtControl::new(VvtConfig {
            second_channel: true,
            direction: [Direction::Direct, Direction::Reverse],
            pid: PIDParams {
                min_output: 0,
                max_output: 10_000,
                ..config().pid
            },
            ..config()
        })
        .unwrap();
        let sink = RecordingSink::default();

        vvt.tick(0, &inputs([20, 20]), &tables([25, 25]), &sink);
        assert!(sink.get(ChannelId::A).unwrap() > DutyCycle::OFF);
        assert_eq!(sink.get(ChannelId::B), Some(DutyCycle::OFF));
        assert_eq!(vvt.pid(ChannelId::B).params().direction, Direction::Reverse);
    }

    #[test]
    fn test_vvt_config_validation() {
        let bad = VvtConfig {
            min_angle: 40,
            max_angle: 40,
            ..config()
        };
        assert!(matches!(VvtControl::<StandardPID>::new(bad.clone()), Err(Error::InvalidConfiguration)));

        let mut vvt: VvtControl = VvtControl::new(config()).unwrap();
        assert_eq!(vvt.set_config(bad), Err(Error::InvalidConfiguration));
        assert_eq!(vvt.config(), &config());
    }
}
