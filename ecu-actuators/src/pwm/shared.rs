use core::cell::RefCell;

use critical_section::Mutex;

use super::{ChannelDriver, ChannelId, CompareTimer, DutyCycle, PwmEngine};
use crate::error::Result;

/// State shared between task context and the compare interrupt.
///
/// Every access goes through [`SharedBlock::lock`], which masks interrupts
/// for the duration of the closure only.
pub struct SharedBlock<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> SharedBlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().into_inner()
    }
}

pub type SharedPwm<T, D> = SharedBlock<PwmEngine<T, D>>;

impl<T: CompareTimer, D: ChannelDriver> SharedBlock<PwmEngine<T, D>> {
    /// Entry point for the compare-match interrupt vector.
    pub fn on_compare_match(&self) {
        self.lock(|engine| engine.on_compare_match());
    }

    pub fn enable(&self) {
        self.lock(|engine| engine.enable());
    }

    pub fn disable(&self) {
        self.lock(|engine| engine.disable());
    }
}

/// Where control loops publish their duty requests.
pub trait DutySink {
    fn set_duty(&self, channel: ChannelId, duty: DutyCycle) -> Result<()>;
}

impl<T: CompareTimer, D: ChannelDriver> DutySink for SharedBlock<PwmEngine<T, D>> {
    fn set_duty(&self, channel: ChannelId, duty: DutyCycle) -> Result<()> {
        self.lock(|engine| engine.set_duty(channel, duty))
    }
}
