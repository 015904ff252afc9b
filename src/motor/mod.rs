// Motor control for Dynamixel servos
//
// Provides:
// - Per-family control table addresses
// - Transaction outcome classification and diagnostics
// - Blocking motion wait loop
// - High-level device controller

pub mod classify;
mod controller;
pub mod motion;
pub mod registers;

pub use classify::{classify, ConfigStep, Diagnostic};
pub use controller::{ControllerError, DeviceController, CENTER_REFERENCE};
pub use motion::{Reached, Timeout};
pub use registers::{ControlTable, MotorFamily, OperatingMode};
