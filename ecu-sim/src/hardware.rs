//! Simulated timer and output pins.
//!
//! All simulated timers read one shared tick counter; each owns its own
//! compare register. Pins integrate the time they spend high so the plant
//! models can be fed the duty that actually reached the solenoid.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::rc::Rc;

use ecu_actuators::CompareTimer;
use embedded_hal::digital::{ErrorType, OutputPin};

pub type Clock = Rc<Cell<u32>>;

#[derive(Debug, Default)]
struct Compare {
    armed: Cell<Option<u32>>,
    enabled: Cell<bool>,
    fired: Cell<u64>,
}

#[derive(Debug, Clone)]
pub struct SimTimer {
    clock: Clock,
    compare: Rc<Compare>,
}

impl SimTimer {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            compare: Rc::new(Compare::default()),
        }
    }

    /// Tick of the next compare match, if the interrupt is enabled.
    pub fn pending(&self) -> Option<u32> {
        self.compare.enabled.get().then(|| self.compare.armed.get()).flatten()
    }

    /// Marks the pending compare as consumed.
    pub fn acknowledge(&self) {
        self.compare.armed.set(None);
        self.compare.fired.set(self.compare.fired.get() + 1);
    }

    pub fn interrupts(&self) -> u64 {
        self.compare.fired.get()
    }
}

impl CompareTimer for SimTimer {
    fn now(&self) -> u32 {
        self.clock.get()
    }

    fn arm_compare_at(&mut self, tick: u32) {
        self.compare.armed.set(Some(tick));
    }

    fn enable_interrupt(&mut self) {
        self.compare.enabled.set(true);
    }

    fn disable_interrupt(&mut self) {
        self.compare.enabled.set(false);
    }
}

#[derive(Debug, Default)]
struct Trace {
    high: bool,
    since: u32,
    high_ticks: u64,
    edges: u64,
}

/// Output pin that records how long it was driven high.
#[derive(Debug, Clone)]
pub struct SimPin {
    clock: Clock,
    trace: Rc<RefCell<Trace>>,
}

impl SimPin {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            trace: Rc::new(RefCell::new(Trace::default())),
        }
    }

    pub fn is_high(&self) -> bool {
        self.trace.borrow().high
    }

    /// Total high time up to the current tick.
    pub fn high_ticks(&self) -> u64 {
        let trace = self.trace.borrow();
        let open = if trace.high {
            u64::from(self.clock.get().wrapping_sub(trace.since))
        } else {
            0
        };
        trace.high_ticks + open
    }

    pub fn edges(&self) -> u64 {
        self.trace.borrow().edges
    }

    fn set(&self, high: bool) {
        let now = self.clock.get();
        let mut trace = self.trace.borrow_mut();
        if trace.high == high {
            return;
        }
        if trace.high {
            trace.high_ticks += u64::from(now.wrapping_sub(trace.since));
        }
        trace.high = high;
        trace.since = now;
        trace.edges += 1;
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}
