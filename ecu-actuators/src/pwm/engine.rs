use super::{ChannelDriver, ChannelId, CompareTimer, DutyCycle, PwmConfig};
use crate::error::{Error, Result};

/// Channel(s) whose falling edge is due at the pending compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    A,
    B,
    Both,
}

impl Selector {
    fn includes(self, channel: ChannelId) -> bool {
        matches!(
            (self, channel),
            (Selector::Both, _) | (Selector::A, ChannelId::A) | (Selector::B, ChannelId::B)
        )
    }

    /// Earliest of up to two deadlines, collapsing a tie into [`Selector::Both`].
    fn earliest(a: Option<u16>, b: Option<u16>) -> Option<(u16, Selector)> {
        match (a, b) {
            (Some(a), Some(b)) if a == b => Some((a, Selector::Both)),
            (Some(a), Some(b)) if a < b => Some((a, Selector::A)),
            (Some(_), Some(b)) => Some((b, Selector::B)),
            (Some(a), None) => Some((a, Selector::A)),
            (None, Some(b)) => Some((b, Selector::B)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextEvent {
    PeriodStart,
    Fall(Selector),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Interrupt off, pins low.
    Idle,
    Running,
    /// Disable requested; the next compare settles pins and goes idle.
    Stopping,
    /// Every channel sits at 0% or 100%, pins settled, interrupt off.
    Parked,
}

#[derive(Debug)]
struct DutyChannel<D> {
    driver: D,
    duty: DutyCycle,
    /// High time for the requested duty, picked up at the next period start.
    target_ticks: u16,
    /// High time latched for the running period.
    high_ticks: u16,
    pin_high: bool,
    at_extremum: bool,
}

impl<D: ChannelDriver> DutyChannel<D> {
    fn new(mut driver: D) -> Self {
        driver.turn_off();
        Self {
            driver,
            duty: DutyCycle::OFF,
            target_ticks: 0,
            high_ticks: 0,
            pin_high: false,
            at_extremum: true,
        }
    }

    /// Pin writes happen only on a level change.
    fn drive(&mut self, high: bool) {
        if high == self.pin_high {
            return;
        }
        if high {
            self.driver.turn_on();
        } else {
            self.driver.turn_off();
        }
        self.pin_high = high;
    }

    /// Latches the requested duty and sets the opening level of a period.
    /// Returns the falling-edge offset when the channel toggles this period.
    fn start_period(&mut self, period: u16) -> Option<u16> {
        self.high_ticks = self.target_ticks;
        if self.high_ticks == 0 {
            self.drive(false);
            self.at_extremum = true;
            None
        } else if self.high_ticks >= period {
            self.drive(true);
            self.at_extremum = true;
            None
        } else {
            self.drive(true);
            self.at_extremum = false;
            Some(self.high_ticks)
        }
    }

    /// Falling edge still ahead of `phase` in the running period.
    fn pending_fall(&self, phase: u16) -> Option<u16> {
        (self.pin_high && !self.at_extremum && self.high_ticks > phase).then_some(self.high_ticks)
    }

    /// True when the requested duty is an extremum the pin already shows.
    fn settled(&self, period: u16) -> bool {
        if self.target_ticks == 0 {
            !self.pin_high
        } else if self.target_ticks >= period {
            self.pin_high
        } else {
            false
        }
    }
}

/// Software PWM for up to two channels sharing one compare register.
///
/// Each period opens with a compare at which every toggling channel is driven
/// high. Falling edges follow in order of their high time, one compare per
/// distinct edge, and a final compare closes the period. Deadlines are
/// measured from the previous compare value, not from the time the handler
/// ran, so handler latency does not drift the phase.
///
/// Duty changes from [`PwmEngine::set_duty`] are picked up at the next period
/// start, so a running period is never cut short or stretched.
#[derive(Debug)]
pub struct PwmEngine<T: CompareTimer, D: ChannelDriver> {
    timer: T,
    period: u16,
    channels: [Option<DutyChannel<D>>; 2],
    next: NextEvent,
    /// Offset into the period of the pending compare.
    phase: u16,
    armed_at: u32,
    mode: EngineMode,
}

impl<T: CompareTimer, D: ChannelDriver> PwmEngine<T, D> {
    /// Builds an idle engine with every pin off.
    pub fn new(mut timer: T, config: &PwmConfig, a: D, b: Option<D>) -> Result<Self> {
        let period = config.period()?;
        timer.disable_interrupt();

        log::debug!(
            "PWM engine: {} Hz carrier, {} ticks per period, {} channel(s)",
            config.carrier_hz,
            period,
            if b.is_some() { 2 } else { 1 }
        );

        Ok(Self {
            timer,
            period,
            channels: [Some(DutyChannel::new(a)), b.map(DutyChannel::new)],
            next: NextEvent::PeriodStart,
            phase: 0,
            armed_at: 0,
            mode: EngineMode::Idle,
        })
    }

    pub fn period(&self) -> u16 {
        self.period
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn next_event(&self) -> NextEvent {
        self.next
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn duty(&self, channel: ChannelId) -> Option<DutyCycle> {
        self.channels[channel.index()].as_ref().map(|ch| ch.duty)
    }

    pub fn is_pin_high(&self, channel: ChannelId) -> Option<bool> {
        self.channels[channel.index()].as_ref().map(|ch| ch.pin_high)
    }

    /// Requests a new duty for `channel`.
    ///
    /// Called from task context. A parked engine is restarted when the new
    /// duty needs toggling or a pin change.
    pub fn set_duty(&mut self, channel: ChannelId, duty: DutyCycle) -> Result<()> {
        let period = self.period;
        let ch = self.channels[channel.index()].as_mut().ok_or(Error::InvalidChannel)?;
        ch.duty = duty;
        ch.target_ticks = duty.ticks(period);

        if self.mode == EngineMode::Parked && !self.all_settled() {
            log::debug!("PWM engine leaving park for {:?} at {:?}", channel, duty);
            self.restart();
            self.mode = EngineMode::Running;
        }
        Ok(())
    }

    /// Starts generating from the next tick.
    pub fn enable(&mut self) {
        match self.mode {
            EngineMode::Idle => {
                self.restart();
                self.mode = EngineMode::Running;
            }
            EngineMode::Stopping => self.mode = EngineMode::Running,
            EngineMode::Running | EngineMode::Parked => {}
        }
    }

    /// Requests a stop. Pins are left as they are; the next compare drives
    /// them low and switches the interrupt off.
    pub fn disable(&mut self) {
        match self.mode {
            EngineMode::Running => self.mode = EngineMode::Stopping,
            EngineMode::Parked => {
                self.restart();
                self.mode = EngineMode::Stopping;
            }
            EngineMode::Idle | EngineMode::Stopping => {}
        }
    }

    /// Immediate teardown: interrupt off and every pin forced low.
    pub fn shutdown(&mut self) {
        self.timer.disable_interrupt();
        for ch in self.channels.iter_mut().flatten() {
            ch.driver.turn_off();
            ch.pin_high = false;
            ch.at_extremum = true;
        }
        self.next = NextEvent::PeriodStart;
        self.mode = EngineMode::Idle;
    }

    /// Compare-match handler. Bounded work, two channels at most.
    pub fn on_compare_match(&mut self) {
        match self.mode {
            EngineMode::Running => match self.next {
                NextEvent::PeriodStart => self.begin_period(),
                NextEvent::Fall(selector) => self.end_pulse(selector),
            },
            EngineMode::Stopping => {
                for ch in self.channels.iter_mut().flatten() {
                    ch.drive(false);
                    ch.at_extremum = true;
                }
                self.timer.disable_interrupt();
                self.next = NextEvent::PeriodStart;
                self.mode = EngineMode::Idle;
            }
            EngineMode::Idle | EngineMode::Parked => {}
        }
    }

    fn begin_period(&mut self) {
        let period = self.period;
        let [a, b] = &mut self.channels;
        let fall_a = a.as_mut().and_then(|ch| ch.start_period(period));
        let fall_b = b.as_mut().and_then(|ch| ch.start_period(period));

        match Selector::earliest(fall_a, fall_b) {
            Some((at, selector)) => {
                self.phase = 0;
                self.advance(at, NextEvent::Fall(selector));
            }
            None => {
                self.timer.disable_interrupt();
                self.next = NextEvent::PeriodStart;
                self.mode = EngineMode::Parked;
            }
        }
    }

    fn end_pulse(&mut self, selector: Selector) {
        for id in ChannelId::ALL {
            if let Some(ch) = self.channels[id.index()].as_mut() {
                if selector.includes(id) {
                    ch.drive(false);
                }
            }
        }

        let phase = self.phase;
        let [a, b] = &self.channels;
        let fall_a = a.as_ref().and_then(|ch| ch.pending_fall(phase));
        let fall_b = b.as_ref().and_then(|ch| ch.pending_fall(phase));

        match Selector::earliest(fall_a, fall_b) {
            Some((at, selector)) => self.advance(at, NextEvent::Fall(selector)),
            None => {
                self.advance(self.period, NextEvent::PeriodStart);
                self.phase = 0;
            }
        }
    }

    /// Arms the compare `offset - phase` ticks after the previous compare.
    fn advance(&mut self, offset: u16, next: NextEvent) {
        let delta = u32::from(offset.saturating_sub(self.phase));
        self.phase = offset;
        self.next = next;
        self.arm(self.armed_at.wrapping_add(delta));
    }

    /// Restarts the period sequence at the next tick.
    fn restart(&mut self) {
        self.armed_at = self.timer.now();
        self.phase = 0;
        self.next = NextEvent::PeriodStart;
        self.arm(self.armed_at.wrapping_add(1));
        self.timer.enable_interrupt();
    }

    /// Arms `target`, pushed to `now + 1` when it is not in the future.
    fn arm(&mut self, target: u32) {
        let now = self.timer.now();
        let target = if (target.wrapping_sub(now) as i32) <= 0 {
            now.wrapping_add(1)
        } else {
            target
        };
        self.timer.arm_compare_at(target);
        self.armed_at = target;
    }

    fn all_settled(&self) -> bool {
        self.channels.iter().flatten().all(|ch| ch.settled(self.period))
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use std::rc::Rc;
    use std::vec::Vec;

    use super::*;

    #[derive(Debug, Default)]
    struct TimerState {
        now: Cell<u32>,
        armed: Cell<Option<u32>>,
        enabled: Cell<bool>,
        arm_count: Cell<u32>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockTimer(Rc<TimerState>);

    impl CompareTimer for MockTimer {
        fn now(&self) -> u32 {
            self.0.now.get()
        }

        fn arm_compare_at(&mut self, tick: u32) {
            self.0.armed.set(Some(tick));
            self.0.arm_count.set(self.0.arm_count.get() + 1);
        }

        fn enable_interrupt(&mut self) {
            self.0.enabled.set(true);
        }

        fn disable_interrupt(&mut self) {
            self.0.enabled.set(false);
        }
    }

    struct MockDriver {
        states: Rc<RefCell<Vec<bool>>>,
    }

    impl ChannelDriver for MockDriver {
        fn turn_on(&mut self) {
            self.states.borrow_mut().push(true);
        }

        fn turn_off(&mut self) {
            self.states.borrow_mut().push(false);
        }
    }

    struct Fixture {
        timer: Rc<TimerState>,
        a: Rc<RefCell<Vec<bool>>>,
        b: Rc<RefCell<Vec<bool>>>,
        engine: PwmEngine<MockTimer, MockDriver>,
    }

    impl Fixture {
        fn new() -> Self {
            let timer = MockTimer::default();
            let state = timer.0.clone();
            let a = Rc::new(RefCell::new(Vec::new()));
            let b = Rc::new(RefCell::new(Vec::new()));
            let config = PwmConfig {
                timer_hz: 100_000,
                carrier_hz: 100,
            };
            let engine = PwmEngine::new(
                timer,
                &config,
                MockDriver { states: a.clone() },
                Some(MockDriver { states: b.clone() }),
            )
            .unwrap();
            Self {
                timer: state,
                a,
                b,
                engine,
            }
        }

        /// Jumps the clock to the armed compare and runs the handler.
        fn fire(&mut self) -> u32 {
            let at = self.timer.armed.get().expect("compare armed");
            assert!(self.timer.enabled.get(), "compare fired with interrupt disabled");
            self.timer.now.set(at);
            self.engine.on_compare_match();
            at
        }
    }

    #[test]
    fn test_new_engine_is_idle_with_pins_off() {
        let fx = Fixture::new();
        assert_eq!(*fx.a.borrow(), [false]);
        assert_eq!(*fx.b.borrow(), [false]);
        assert_eq!(fx.engine.mode(), EngineMode::Idle);
        assert_eq!(fx.engine.period(), 1000);
        assert!(!fx.timer.enabled.get());
    }

    #[test]
    fn test_invalid_carrier_rejected() {
        let config = PwmConfig {
            timer_hz: 1000,
            carrier_hz: 1000,
        };
        let driver = MockDriver {
            states: Rc::new(RefCell::new(Vec::new())),
        };
        let result = PwmEngine::new(MockTimer::default(), &config, driver, None);
        assert!(matches!(result, Err(Error::InvalidCarrier)));
    }

    #[test]
    fn test_set_duty_missing_channel() {
        let driver = MockDriver {
            states: Rc::new(RefCell::new(Vec::new())),
        };
        let mut engine = PwmEngine::new(MockTimer::default(), &PwmConfig::default(), driver, None).unwrap();
        assert_eq!(engine.set_duty(ChannelId::B, DutyCycle::FULL), Err(Error::InvalidChannel));
        assert_eq!(engine.set_duty(ChannelId::A, DutyCycle::FULL), Ok(()));
        assert_eq!(engine.duty(ChannelId::A), Some(DutyCycle::FULL));
        assert_eq!(engine.duty(ChannelId::B), None);
    }

    #[test]
    fn test_enable_arms_next_tick() {
        let mut fx = Fixture::new();
        fx.timer.now.set(500);
        fx.engine.enable();
        assert_eq!(fx.timer.armed.get(), Some(501));
        assert!(fx.timer.enabled.get());
        assert_eq!(fx.engine.mode(), EngineMode::Running);
        assert_eq!(fx.engine.next_event(), NextEvent::PeriodStart);
    }

    #[test]
    fn test_all_off_parks_then_set_duty_restarts() {
        let mut fx = Fixture::new();
        fx.engine.enable();
        fx.fire();
        assert_eq!(fx.engine.mode(), EngineMode::Parked);
        assert!(!fx.timer.enabled.get());

        // Re-requesting an extremum the pins already show keeps it parked
        fx.engine.set_duty(ChannelId::A, DutyCycle::OFF).unwrap();
        assert_eq!(fx.engine.mode(), EngineMode::Parked);

        fx.timer.now.set(4000);
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(40)).unwrap();
        assert_eq!(fx.engine.mode(), EngineMode::Running);
        assert_eq!(fx.timer.armed.get(), Some(4001));
        assert!(fx.timer.enabled.get());

        assert_eq!(fx.fire(), 4001);
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(true));
        assert_eq!(fx.timer.armed.get(), Some(4401));
    }

    #[test]
    fn test_full_duty_parks_with_pin_high() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::FULL).unwrap();
        fx.engine.enable();
        fx.fire();
        assert_eq!(fx.engine.mode(), EngineMode::Parked);
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(true));
        assert_eq!(fx.engine.is_pin_high(ChannelId::B), Some(false));
        assert_eq!(*fx.a.borrow(), [false, true]);
    }

    #[test]
    fn test_disable_settles_on_next_compare() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(50)).unwrap();
        fx.engine.enable();
        fx.fire();
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(true));

        fx.engine.disable();
        assert_eq!(fx.engine.mode(), EngineMode::Stopping);
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(true), "disable must not touch pins");
        assert_eq!(*fx.a.borrow(), [false, true]);

        fx.fire();
        assert_eq!(fx.engine.mode(), EngineMode::Idle);
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(false));
        assert!(!fx.timer.enabled.get());
    }

    #[test]
    fn test_disable_while_parked_rearms_to_settle() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::B, DutyCycle::FULL).unwrap();
        fx.engine.enable();
        fx.fire();
        assert_eq!(fx.engine.mode(), EngineMode::Parked);

        fx.engine.disable();
        assert_eq!(fx.engine.is_pin_high(ChannelId::B), Some(true));
        assert!(fx.timer.enabled.get());

        fx.fire();
        assert_eq!(fx.engine.is_pin_high(ChannelId::B), Some(false));
        assert_eq!(fx.engine.mode(), EngineMode::Idle);
    }

    #[test]
    fn test_enable_cancels_pending_stop() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(30)).unwrap();
        fx.engine.enable();
        fx.fire();
        fx.engine.disable();
        fx.engine.enable();
        fx.fire();
        assert_eq!(fx.engine.mode(), EngineMode::Running);
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(false));
    }

    #[test]
    fn test_shutdown_forces_pins_off() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(60)).unwrap();
        fx.engine.set_duty(ChannelId::B, DutyCycle::from_percent(60)).unwrap();
        fx.engine.enable();
        fx.fire();

        fx.engine.shutdown();
        assert_eq!(fx.engine.mode(), EngineMode::Idle);
        assert_eq!(fx.engine.is_pin_high(ChannelId::A), Some(false));
        assert_eq!(fx.engine.is_pin_high(ChannelId::B), Some(false));
        assert_eq!(fx.a.borrow().last(), Some(&false));
        assert_eq!(fx.b.borrow().last(), Some(&false));
        assert!(!fx.timer.enabled.get());
    }

    #[test]
    fn test_duty_change_waits_for_period_start() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(50)).unwrap();
        fx.engine.enable();
        let start = fx.fire();

        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(20)).unwrap();
        assert_eq!(fx.fire(), start + 500);
        assert_eq!(fx.fire(), start + 1000);
        assert_eq!(fx.fire(), start + 1200);
    }

    #[test]
    fn test_late_handler_never_arms_the_past() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(10)).unwrap();
        fx.engine.enable();
        let start = fx.fire();
        assert_eq!(fx.timer.armed.get(), Some(start + 100));

        // Handler runs long after its deadline
        fx.timer.now.set(start + 150);
        fx.engine.on_compare_match();
        assert_eq!(fx.timer.armed.get(), Some(start + 1000));

        fx.timer.now.set(start + 1000);
        fx.engine.on_compare_match();
        assert_eq!(fx.timer.armed.get(), Some(start + 1100));

        // Past both the edge and the period end
        fx.timer.now.set(start + 2500);
        fx.engine.on_compare_match();
        assert_eq!(fx.timer.armed.get(), Some(start + 2501));
    }

    #[test]
    fn test_equal_duties_share_one_compare() {
        let mut fx = Fixture::new();
        fx.engine.set_duty(ChannelId::A, DutyCycle::from_percent(35)).unwrap();
        fx.engine.set_duty(ChannelId::B, DutyCycle::from_percent(35)).unwrap();
        fx.engine.enable();
        let before = fx.timer.arm_count.get();
        fx.fire();
        assert_eq!(fx.engine.next_event(), NextEvent::Fall(Selector::Both));
        fx.fire();
        assert_eq!(fx.engine.next_event(), NextEvent::PeriodStart);
        assert_eq!(fx.timer.arm_count.get() - before, 2);
        assert_eq!(*fx.a.borrow(), [false, true, false]);
        assert_eq!(*fx.b.borrow(), [false, true, false]);
    }
}
