use std::time::Duration;

use ecu_actuators::{
    ActuatorState, ActuatorStatus, BoostControl, ChannelId, ControlLoop, DutyCycle, EngineInputs, PinDriver, Polarity,
    PwmEngine, SharedBlock, SharedPwm, VvtControl, DUTY_FULL_SCALE,
};
use serde::Serialize;
use tokio::time;

use crate::error::SimError;
use crate::hardware::{Clock, SimPin, SimTimer};
use crate::plant::{BoostPlant, CamPhaser};
use crate::settings::Settings;

pub mod error;
pub mod hardware;
pub mod plant;
pub mod settings;

type SimPwm = SharedPwm<SimTimer, PinDriver<SimPin>>;

#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub t_ms: u32,
    pub rpm: u16,
    pub map_kpa: u16,
    pub cam_angle: [i16; 2],
    pub boost: ActuatorStatus,
    pub vvt: ActuatorStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StateCounts {
    pub disabled: u32,
    pub warmup_hold: u32,
    pub open_loop: u32,
    pub closed_loop: u32,
    pub fault: u32,
}

impl StateCounts {
    fn record(&mut self, state: ActuatorState) {
        let slot = match state {
            ActuatorState::Disabled => &mut self.disabled,
            ActuatorState::WarmupHold => &mut self.warmup_hold,
            ActuatorState::ActiveOpenLoop => &mut self.open_loop,
            ActuatorState::ActiveClosedLoop => &mut self.closed_loop,
            ActuatorState::Fault => &mut self.fault,
        };
        *slot += 1;
    }
}

/// Commanded against delivered duty for one solenoid, in percent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelSummary {
    pub commanded_duty_pct: f64,
    pub measured_duty_pct: f64,
    pub edges: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActuatorSummary {
    pub states: StateCounts,
    pub channels: Vec<ChannelSummary>,
    pub interrupts: u64,
    /// Mean absolute closed-loop error, in feedback units.
    pub mean_abs_error: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub duration_ms: u32,
    pub boost: ActuatorSummary,
    pub vvt: ActuatorSummary,
    pub trace: Vec<Sample>,
}

impl Report {
    pub fn to_json(&self) -> Result<String, SimError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One simulated solenoid output and its running tallies.
struct Output {
    channel: ChannelId,
    pin: SimPin,
    commanded: f64,
}

/// An engine, its timer and its pins.
struct Bench {
    timer: SimTimer,
    pwm: SimPwm,
    outputs: Vec<Output>,
    last_high: Vec<u64>,
}

impl Bench {
    fn new(clock: &Clock, config: &ecu_actuators::PwmConfig, channels: usize) -> Result<Self, SimError> {
        let timer = SimTimer::new(clock.clone());
        let pins: Vec<SimPin> = (0..channels).map(|_| SimPin::new(clock.clone())).collect();
        let a = PinDriver::new(pins[0].clone(), Polarity::ActiveHigh);
        let b = pins.get(1).map(|pin| PinDriver::new(pin.clone(), Polarity::ActiveHigh));
        let engine = PwmEngine::new(timer.clone(), config, a, b)?;

        let outputs = pins
            .into_iter()
            .zip(ChannelId::ALL)
            .map(|(pin, channel)| Output {
                channel,
                pin,
                commanded: 0.0,
            })
            .collect::<Vec<_>>();

        Ok(Self {
            timer,
            pwm: SharedBlock::new(engine),
            last_high: vec![0; outputs.len()],
            outputs,
        })
    }

    fn fire_if_due(&self, now: u32) {
        if self.timer.pending() == Some(now) {
            self.timer.acknowledge();
            self.pwm.on_compare_match();
        }
    }

    /// Fraction of the last `window` ticks each pin spent high.
    fn delivered(&mut self, window: u64) -> [f64; 2] {
        let mut duty = [0.0; 2];
        for (index, output) in self.outputs.iter().enumerate() {
            let high = output.pin.high_ticks();
            duty[index] = (high - self.last_high[index]) as f64 / window as f64;
            self.last_high[index] = high;
        }
        duty
    }

    fn accumulate(&mut self, status: &ActuatorStatus) {
        for output in &mut self.outputs {
            output.commanded += f64::from(status.duty[output.channel.index()].raw());
        }
    }

    fn summarize(&self, summary: &mut ActuatorSummary, steps: u32, total_ticks: u64) {
        let full = f64::from(DUTY_FULL_SCALE);
        summary.interrupts = self.timer.interrupts();
        summary.channels = self
            .outputs
            .iter()
            .map(|output| ChannelSummary {
                commanded_duty_pct: output.commanded / f64::from(steps.max(1)) / full * 100.0,
                measured_duty_pct: output.pin.high_ticks() as f64 / total_ticks.max(1) as f64 * 100.0,
                edges: output.pin.edges(),
            })
            .collect();
    }
}

fn percent(duty: DutyCycle) -> f64 {
    f64::from(duty.raw()) / f64::from(DUTY_FULL_SCALE)
}

/// Runs the boost and VVT loops against the simulated engine for the
/// configured duration.
pub async fn run(settings: &Settings) -> Result<Report, SimError> {
    let sim = &settings.simulation;
    let profile = &settings.profile;
    let plant_config = &settings.plant;

    let clock = Clock::default();
    let mut boost_bench = Bench::new(&clock, &sim.boost_pwm, 1)?;
    let vvt_channels = if settings.vvt.second_channel { 2 } else { 1 };
    let mut vvt_bench = Bench::new(&clock, &sim.vvt_pwm, vvt_channels)?;

    let mut boost: BoostControl = BoostControl::new(settings.boost.clone())?;
    let mut vvt: VvtControl = VvtControl::new(settings.vvt.clone())?;

    boost_bench.pwm.enable();
    vvt_bench.pwm.enable();

    let ticks_per_ms = u64::from(sim.boost_pwm.timer_hz) / 1000;
    let interval_ticks = u64::from(sim.control_interval_ms) * ticks_per_ms;
    let end_tick = u64::from(sim.duration_ms) * ticks_per_ms;

    let mut boost_plant = BoostPlant::new(profile.baro_kpa);
    let mut cams = [CamPhaser::new(plant_config), CamPhaser::new(plant_config)];
    let mut report = Report {
        duration_ms: sim.duration_ms,
        ..Report::default()
    };
    let mut boost_error = (0.0, 0u32);
    let mut vvt_error = (0.0, 0u32);
    let mut steps = 0u32;

    let mut pacing = sim.realtime.then(|| time::interval(Duration::from_millis(u64::from(sim.control_interval_ms))));

    tracing::info!(
        "Simulating {} ms: boost {} ticks/period, VVT {} ticks/period",
        sim.duration_ms,
        sim.boost_pwm.period()?,
        sim.vvt_pwm.period()?
    );

    let mut next_control = 0u64;
    loop {
        let pending = [boost_bench.timer.pending(), vvt_bench.timer.pending()];
        let next_tick = pending
            .into_iter()
            .flatten()
            .map(u64::from)
            .fold(next_control, u64::min);
        if next_tick > end_tick {
            break;
        }

        let now = next_tick as u32;
        clock.set(now);
        boost_bench.fire_if_due(now);
        vvt_bench.fire_if_due(now);

        if next_tick != next_control {
            continue;
        }

        let t_ms = (next_tick / ticks_per_ms) as u32;
        let dt_ms = f64::from(sim.control_interval_ms);
        let rpm = profile.rpm_at(t_ms);

        if next_tick > 0 {
            let boost_duty = boost_bench.delivered(interval_ticks);
            boost_plant.step(plant_config, dt_ms, boost_duty[0], rpm, profile.tps, profile.baro_kpa);
            let cam_duty = vvt_bench.delivered(interval_ticks);
            for (cam, duty) in cams.iter_mut().zip(cam_duty) {
                cam.step(plant_config, dt_ms, duty, true);
            }
        }

        let cam_angle = profile.cam_reading(t_ms, [cams[0].angle(), cams[1].angle()]);
        let inputs = EngineInputs {
            rpm,
            map_kpa: boost_plant.map_kpa(),
            baro_kpa: profile.baro_kpa,
            tps: profile.tps,
            coolant_c: profile.coolant_c,
            cam_angle,
            running: true,
            gear: profile.gear,
            ethanol_pct: profile.ethanol_pct,
        };

        let boost_state = boost.tick(t_ms, &inputs, &settings.tables, &boost_bench.pwm);
        let vvt_state = vvt.tick(t_ms, &inputs, &settings.tables, &vvt_bench.pwm);

        report.boost.states.record(boost_state);
        report.vvt.states.record(vvt_state);
        boost_bench.accumulate(boost.status());
        vvt_bench.accumulate(vvt.status());

        if boost_state == ActuatorState::ActiveClosedLoop {
            let target = boost.status().target[settings.boost.channel.index()];
            boost_error.0 += f64::from((target - i32::from(inputs.map_kpa)).abs());
            boost_error.1 += 1;
        }
        if vvt_state == ActuatorState::ActiveClosedLoop {
            for index in 0..vvt_channels {
                vvt_error.0 += f64::from((vvt.status().target[index] - i32::from(cam_angle[index])).abs());
                vvt_error.1 += 1;
            }
        }

        if steps % sim.sample_every == 0 {
            tracing::debug!(
                "t={} ms rpm={} map={} kPa boost {:?} {:.1}% cam={:?} vvt {:?}",
                t_ms,
                rpm,
                inputs.map_kpa,
                boost_state,
                percent(boost.status().duty[0]) * 100.0,
                cam_angle,
                vvt_state
            );
            report.trace.push(Sample {
                t_ms,
                rpm,
                map_kpa: inputs.map_kpa,
                cam_angle,
                boost: *boost.status(),
                vvt: *vvt.status(),
            });
        }

        steps += 1;
        next_control += interval_ticks;

        if let Some(interval) = pacing.as_mut() {
            interval.tick().await;
        }
    }

    boost_bench.pwm.lock(|engine| engine.shutdown());
    vvt_bench.pwm.lock(|engine| engine.shutdown());

    boost_bench.summarize(&mut report.boost, steps, end_tick);
    vvt_bench.summarize(&mut report.vvt, steps, end_tick);
    report.boost.mean_abs_error = boost_error.0 / f64::from(boost_error.1.max(1));
    report.vvt.mean_abs_error = vvt_error.0 / f64::from(vvt_error.1.max(1));

    if report.vvt.states.fault > 0 {
        tracing::warn!("VVT spent {} control ticks in fault", report.vvt.states.fault);
    }
    tracing::info!(
        "Boost mean error {:.1} kPa, VVT mean error {:.1} deg",
        report.boost.mean_abs_error,
        report.vvt.mean_abs_error
    );

    Ok(report)
}
