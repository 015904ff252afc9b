// Dynamixel control table addresses per motor family

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const TORQUE_ENABLE: u8 = 1;
pub const TORQUE_DISABLE: u8 = 0;

/// Native encoder range of a single turn
pub const MIN_POSITION: i32 = 0;
pub const MAX_POSITION: i32 = 4095;

/// Degrees per encoder unit for 4096-step motors
pub const DEGREES_PER_UNIT: f32 = 0.088;

/// Register addresses of the fields the controller touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTable {
    pub torque_enable: u16, // 1 byte
    pub goal_position: u16, // 4 bytes
    pub present_position: u16, // 4 bytes, read-only
    pub homing_offset: u16, // 4 bytes, EEPROM
    pub operating_mode: u16, // 1 byte, EEPROM
}

const X_SERIES: ControlTable = ControlTable {
    torque_enable: 64,
    goal_position: 116,
    present_position: 132,
    homing_offset: 20,
    operating_mode: 11,
};

const MX_SERIES: ControlTable = ControlTable {
    torque_enable: 24,
    goal_position: 596,
    present_position: 36,
    homing_offset: 20,
    operating_mode: 11,
};

const PRO_SERIES: ControlTable = ControlTable {
    torque_enable: 562,
    goal_position: 564,
    present_position: 596,
    homing_offset: 20,
    operating_mode: 11,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MotorFamily {
    XSeries,
    MxSeries,
    ProSeries,
}

impl MotorFamily {
    pub const ALL: [MotorFamily; 3] = [Self::XSeries, Self::MxSeries, Self::ProSeries];

    pub const fn control_table(self) -> &'static ControlTable {
        match self {
            Self::XSeries => &X_SERIES,
            Self::MxSeries => &MX_SERIES,
            Self::ProSeries => &PRO_SERIES,
        }
    }
}

/// Value written to the operating mode register
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Position = 3,
    ExtendedPosition = 4,
}

impl OperatingMode {
    /// Position the motor returns to on reset
    pub const fn origin_position(self) -> i32 {
        match self {
            Self::Position => (1 + 4065) / 2,
            Self::ExtendedPosition => 0,
        }
    }
}

/// Convert a raw encoder reading to degrees
pub fn position_to_degrees(raw: i32) -> f32 {
    raw as f32 * DEGREES_PER_UNIT
}
