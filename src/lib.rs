//! Control layer for Dynamixel servos behind a USB serial adapter.
//!
//! ```no_run
//! use dynamixel_helper::config::ControllerConfig;
//! use dynamixel_helper::motor::DeviceController;
//!
//! let config = ControllerConfig::default();
//! let mut dxl = DeviceController::connect(&config)?;
//! dxl.add_motor(1, false);
//! dxl.set_goal(1, 8000, true)?;
//! println!("Current position {}", dxl.position(1));
//! # Ok::<(), dynamixel_helper::motor::ControllerError>(())
//! ```

pub mod config;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod transport;
