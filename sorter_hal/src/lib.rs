//! Sorter Hardware Abstraction Layer
//!
//! Uniform capabilities over the pins the sorter owns: diverter actuators
//! (stepper and on/off), the debounced camera-trigger input, ultrasonic
//! bin-level sensors, and the PWM belt drive. A simulation backend stands
//! in for real GPIO so the whole control plane runs and tests off-target.
//!
//! Every pin is owned by exactly one component; the [`pins::PinRegistry`]
//! refuses duplicate claims at startup.

pub mod actuator;
pub mod belt;
pub mod edge;
pub mod gpio;
pub mod pins;
pub mod ultrasonic;

pub use gpio::{GpioBackend, HalError, Level, SimBackend};
