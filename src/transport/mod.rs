// Register transaction interface to the servo bus
//
// The controller never sees raw bytes. It issues single-register reads and
// writes through `Transport` and gets back a communication result plus the
// device's error byte.

mod serial;
mod sim;

use std::fmt;

pub use serial::SerialTransport;
pub use sim::{SimTransport, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(TransportError::UnsupportedProtocol(other)),
        }
    }
}

/// Outcome of a transaction on the link itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommResult {
    Success,
    PortBusy,
    TxFail,
    RxFail,
    TxError,
    RxWaiting,
    RxTimeout,
    RxCorrupt,
    NotAvailable,
}

impl CommResult {
    /// Numeric code as used by the Robotis SDKs
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::PortBusy => -1000,
            Self::TxFail => -1001,
            Self::RxFail => -1002,
            Self::TxError => -2000,
            Self::RxWaiting => -3000,
            Self::RxTimeout => -3001,
            Self::RxCorrupt => -3002,
            Self::NotAvailable => -9000,
        }
    }
}

impl fmt::Display for CommResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "communication success",
            Self::PortBusy => "port is in use",
            Self::TxFail => "failed to transmit instruction packet",
            Self::RxFail => "failed to get status packet from device",
            Self::TxError => "incorrect instruction packet",
            Self::RxWaiting => "still receiving status packet",
            Self::RxTimeout => "no status packet",
            Self::RxCorrupt => "incorrect status packet",
            Self::NotAvailable => "protocol does not support this function",
        };
        f.write_str(text)
    }
}

/// Result pair produced by every register transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResult {
    pub comm: CommResult,
    pub error: u8,
}

impl TxResult {
    pub const OK: TxResult = TxResult {
        comm: CommResult::Success,
        error: 0,
    };

    pub const fn comm_failure(comm: CommResult) -> Self {
        Self { comm, error: 0 }
    }

    pub const fn device_error(error: u8) -> Self {
        Self {
            comm: CommResult::Success,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.comm == CommResult::Success && self.error == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Port {0} is not open")]
    NotOpen(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedProtocol(u8),

    #[error("Port {0} is unavailable")]
    Unavailable(String),
}

/// Typed single-register transactions against a Dynamixel bus
pub trait Transport {
    /// Human-readable name of the underlying port
    fn port_name(&self) -> &str;

    fn protocol(&self) -> ProtocolVersion;

    fn open(&mut self) -> Result<(), TransportError>;

    fn set_baud_rate(&mut self, baudrate: u32) -> Result<(), TransportError>;

    fn write_1_byte(&mut self, id: u8, address: u16, value: u8) -> TxResult;

    fn write_4_byte(&mut self, id: u8, address: u16, value: u32) -> TxResult;

    fn read_4_byte(&mut self, id: u8, address: u16) -> (u32, TxResult);

    fn close(&mut self);

    fn describe_result(&self, result: CommResult) -> String {
        format!("[TxRxResult] {}", result)
    }

    fn describe_error(&self, error: u8) -> String {
        describe_device_error(self.protocol(), error)
    }
}

/// Decode the error byte of a status packet
pub fn describe_device_error(protocol: ProtocolVersion, error: u8) -> String {
    match protocol {
        ProtocolVersion::V1 => {
            const BITS: [&str; 7] = [
                "input voltage error",
                "angle limit error",
                "overheat error",
                "out of range error",
                "checksum error",
                "overload error",
                "instruction code error",
            ];
            let flags: Vec<&str> = BITS
                .iter()
                .enumerate()
                .filter(|(bit, _)| error & (1 << bit) != 0)
                .map(|(_, name)| *name)
                .collect();
            if flags.is_empty() {
                "[RxPacketError] none".to_string()
            } else {
                format!("[RxPacketError] {}", flags.join(", "))
            }
        }
        ProtocolVersion::V2 => {
            let mut text = match error & 0x7F {
                0 => "none".to_string(),
                1 => "failed to process the instruction packet".to_string(),
                2 => "undefined instruction or missing action".to_string(),
                3 => "CRC does not match".to_string(),
                4 => "data value out of range".to_string(),
                5 => "data length shorter than the register".to_string(),
                6 => "data value exceeds the limit".to_string(),
                7 => "writing to read-only or EEPROM with torque on".to_string(),
                other => format!("unknown error code {}", other),
            };
            if error & 0x80 != 0 {
                text.push_str(" (hardware alert)");
            }
            format!("[RxPacketError] {}", text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_result_success() {
        assert!(TxResult::OK.is_success());
        assert!(!TxResult::comm_failure(CommResult::RxTimeout).is_success());
        assert!(!TxResult::device_error(0x04).is_success());
    }

    #[test]
    fn test_protocol_version() {
        assert_eq!(ProtocolVersion::try_from(1).unwrap(), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::try_from(2).unwrap(), ProtocolVersion::V2);
        assert!(matches!(
            ProtocolVersion::try_from(3),
            Err(TransportError::UnsupportedProtocol(3))
        ));
    }

    #[test]
    fn test_describe_device_error() {
        assert_eq!(
            describe_device_error(ProtocolVersion::V2, 0x04),
            "[RxPacketError] data value out of range"
        );
        assert!(describe_device_error(ProtocolVersion::V2, 0x81).ends_with("(hardware alert)"));
        assert_eq!(
            describe_device_error(ProtocolVersion::V1, 0b0010_0100),
            "[RxPacketError] overheat error, overload error"
        );
    }

    #[test]
    fn test_comm_result_codes() {
        assert_eq!(CommResult::Success.code(), 0);
        assert_eq!(CommResult::RxTimeout.code(), -3001);
        assert_eq!(CommResult::NotAvailable.code(), -9000);
    }
}
