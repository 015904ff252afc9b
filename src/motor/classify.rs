// Transaction outcome classification and the diagnostics it produces

use serde::Serialize;

use crate::transport::{CommResult, Transport, TxResult};

/// Check a transaction outcome.
///
/// Succeeds only when the link reported success and the device error byte
/// is zero. Otherwise returns the transport's description of what went wrong.
pub fn classify<T: Transport + ?Sized>(transport: &T, result: TxResult) -> Result<(), String> {
    if result.comm != CommResult::Success {
        Err(transport.describe_result(result.comm))
    } else if result.error != 0 {
        Err(transport.describe_error(result.error))
    } else {
        Ok(())
    }
}

/// Registration step a motor failed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStep {
    OperatingMode,
    Centering,
    HomingOffset,
    TorqueEnable,
}

/// Non-fatal transaction failure reported by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    #[error("Unable to reach motor {id} ({step:?}): {detail}")]
    UnreachableMotor { id: u8, step: ConfigStep, detail: String },

    #[error("Unable to set goal on motor {id}: {detail}")]
    CommunicationFailure { id: u8, detail: String },

    #[error("Get position failed on motor {id}: {detail}")]
    ReadFailure { id: u8, detail: String },

    #[error("Unable to write homing offset on motor {id}: {detail}")]
    HomingFailure { id: u8, detail: String },

    #[error("Unable to disable torque on motor {id}: {detail}")]
    TorqueDisableFailure { id: u8, detail: String },
}

impl Diagnostic {
    pub fn motor_id(&self) -> u8 {
        match self {
            Self::UnreachableMotor { id, .. }
            | Self::CommunicationFailure { id, .. }
            | Self::ReadFailure { id, .. }
            | Self::HomingFailure { id, .. }
            | Self::TorqueDisableFailure { id, .. } => *id,
        }
    }
}
