use embedded_hal::digital::OutputPin;
use serde::{Deserialize, Serialize};

/// Switches one actuator output. Implementations must not block; they run
/// inside the compare interrupt.
pub trait ChannelDriver {
    fn turn_on(&mut self);
    fn turn_off(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

/// Drives a solenoid straight from a GPIO.
#[derive(Debug)]
pub struct PinDriver<P: OutputPin> {
    pin: P,
    polarity: Polarity,
}

impl<P: OutputPin> PinDriver<P> {
    pub fn new(pin: P, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }
}

impl<P: OutputPin> ChannelDriver for PinDriver<P> {
    fn turn_on(&mut self) {
        match self.polarity {
            Polarity::ActiveHigh => self.pin.set_high().ok(),
            Polarity::ActiveLow => self.pin.set_low().ok(),
        };
    }

    fn turn_off(&mut self) {
        match self.polarity {
            Polarity::ActiveHigh => self.pin.set_low().ok(),
            Polarity::ActiveLow => self.pin.set_high().ok(),
        };
    }
}
