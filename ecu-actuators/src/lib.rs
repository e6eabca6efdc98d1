#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Actuator duty-cycle control for an engine control unit.
//!
//! | Module | Purpose |
//! | ------ | ------- |
//! | [`fixed`] | Q15.16 fixed-point gain type shared by every PID strategy |
//! | [`control`] | Standard and ideal integer PID controllers |
//! | [`pwm`] | Two-channel software PWM multiplexed onto one compare register |
//! | [`actuator`] | Boost and VVT control loops feeding the PWM engine |

pub mod actuator;
pub mod control;
pub mod error;
pub mod fixed;
pub mod pwm;

pub use actuator::*;
pub use control::*;
pub use error::*;
pub use fixed::Fixed;
pub use pwm::*;
