// Dynamixel packet transport over a USB serial adapter (U2D2)
//
// Protocol 1.0: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Protocol 2.0: [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, Instruction, Params..., CRC_L, CRC_H]

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{Read, Write};
use tracing::debug;

use super::{CommResult, ProtocolVersion, Transport, TransportError, TxResult};
use crate::config::SERIAL_TIMEOUT;

const HEADER_V1: [u8; 2] = [0xFF, 0xFF];
const HEADER_V2: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Instruction byte of a status packet (protocol 2.0 only)
const STATUS_INSTRUCTION: u8 = 0x55;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Instruction {
    Read = 0x02,
    Write = 0x03,
}

/// Error byte and parameters of a status packet
#[derive(Debug, PartialEq)]
struct StatusPacket {
    id: u8,
    error: u8,
    params: Vec<u8>,
}

/// U2D2 serial link speaking protocol 1.0 or 2.0
pub struct SerialTransport {
    port_name: String,
    protocol: ProtocolVersion,
    baudrate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(port_name: &str, protocol: ProtocolVersion) -> Self {
        Self {
            port_name: port_name.to_string(),
            protocol,
            baudrate: crate::config::BAUDRATE,
            port: None,
        }
    }

    /// Protocol 1.0 checksum over id, length, instruction, params
    fn checksum(data: &[u8]) -> u8 {
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        !(sum as u8)
    }

    fn crc(data: &[u8]) -> u16 {
        crc16::State::<crc16::BUYPASS>::calculate(data)
    }

    /// Insert 0xFD after every 0xFF 0xFF 0xFD in a protocol 2.0 payload
    fn stuff(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 2);
        for &b in data {
            out.push(b);
            if out.ends_with(&[0xFF, 0xFF, 0xFD]) {
                out.push(0xFD);
            }
        }
        out
    }

    fn unstuff(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut skip_next = false;
        for &b in data {
            if skip_next {
                skip_next = false;
                if b == 0xFD {
                    continue;
                }
            }
            out.push(b);
            if out.ends_with(&[0xFF, 0xFF, 0xFD]) {
                skip_next = true;
            }
        }
        out
    }

    fn build_packet(protocol: ProtocolVersion, id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        match protocol {
            ProtocolVersion::V1 => {
                let length = (params.len() + 2) as u8; // params + instruction + checksum
                let mut packet = Vec::with_capacity(6 + params.len());
                packet.extend_from_slice(&HEADER_V1);
                packet.push(id);
                packet.push(length);
                packet.push(instruction as u8);
                packet.extend_from_slice(params);
                packet.push(Self::checksum(&packet[2..]));
                packet
            }
            ProtocolVersion::V2 => {
                let mut body = vec![instruction as u8];
                body.extend_from_slice(params);
                let body = Self::stuff(&body);
                let length = (body.len() + 2) as u16; // body + CRC

                let mut packet = Vec::with_capacity(9 + body.len());
                packet.extend_from_slice(&HEADER_V2);
                packet.push(id);
                packet.extend_from_slice(&length.to_le_bytes());
                packet.extend_from_slice(&body);
                let crc = Self::crc(&packet);
                packet.extend_from_slice(&crc.to_le_bytes());
                packet
            }
        }
    }

    /// Parse a complete protocol 1.0 status packet
    fn parse_status_v1(bytes: &[u8]) -> Result<StatusPacket, CommResult> {
        if bytes.len() < 6 || bytes[..2] != HEADER_V1 {
            return Err(CommResult::RxCorrupt);
        }
        let end = bytes.len() - 1;
        if Self::checksum(&bytes[2..end]) != bytes[end] {
            return Err(CommResult::RxCorrupt);
        }
        Ok(StatusPacket {
            id: bytes[2],
            error: bytes[4],
            params: bytes[5..end].to_vec(),
        })
    }

    /// Parse a complete protocol 2.0 status packet
    fn parse_status_v2(bytes: &[u8]) -> Result<StatusPacket, CommResult> {
        if bytes.len() < 11 || bytes[..4] != HEADER_V2 {
            return Err(CommResult::RxCorrupt);
        }
        let end = bytes.len() - 2;
        let received = u16::from_le_bytes([bytes[end], bytes[end + 1]]);
        if Self::crc(&bytes[..end]) != received {
            return Err(CommResult::RxCorrupt);
        }
        if bytes[7] != STATUS_INSTRUCTION {
            return Err(CommResult::RxCorrupt);
        }
        Ok(StatusPacket {
            id: bytes[4],
            error: bytes[8],
            params: Self::unstuff(&bytes[9..end]),
        })
    }

    fn read_exact(port: &mut Box<dyn SerialPort>, buf: &mut [u8]) -> Result<(), CommResult> {
        port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                CommResult::RxTimeout
            } else {
                CommResult::RxFail
            }
        })
    }

    fn read_response(&mut self, expected_id: u8) -> Result<StatusPacket, CommResult> {
        let protocol = self.protocol;
        let port = self.port.as_mut().ok_or(CommResult::RxFail)?;

        let (mut bytes, length) = match protocol {
            ProtocolVersion::V1 => {
                let mut header = [0u8; 4];
                Self::read_exact(port, &mut header)?;
                (header.to_vec(), header[3] as usize)
            }
            ProtocolVersion::V2 => {
                let mut header = [0u8; 7];
                Self::read_exact(port, &mut header)?;
                let length = u16::from_le_bytes([header[5], header[6]]) as usize;
                (header.to_vec(), length)
            }
        };

        let mut remaining = vec![0u8; length];
        Self::read_exact(port, &mut remaining)?;
        bytes.extend_from_slice(&remaining);

        let status = match protocol {
            ProtocolVersion::V1 => Self::parse_status_v1(&bytes)?,
            ProtocolVersion::V2 => Self::parse_status_v2(&bytes)?,
        };
        if status.id != expected_id {
            debug!("Status from motor {} while waiting for {}", status.id, expected_id);
            return Err(CommResult::RxCorrupt);
        }
        Ok(status)
    }

    /// One instruction/status round trip
    fn txrx(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<StatusPacket, CommResult> {
        let packet = Self::build_packet(self.protocol, id, instruction, params);
        let port = self.port.as_mut().ok_or(CommResult::TxFail)?;

        // Stale bytes from an earlier timeout would corrupt the next status
        if let Err(e) = port.clear(ClearBuffer::Input) {
            debug!("Failed to clear input on {}: {}", self.port_name, e);
        }
        port.write_all(&packet).map_err(|_| CommResult::TxFail)?;
        port.flush().map_err(|_| CommResult::TxFail)?;

        self.read_response(id)
    }

    fn address_params(&self, address: u16) -> Result<Vec<u8>, CommResult> {
        match self.protocol {
            ProtocolVersion::V1 => u8::try_from(address)
                .map(|a| vec![a])
                .map_err(|_| CommResult::TxError),
            ProtocolVersion::V2 => Ok(address.to_le_bytes().to_vec()),
        }
    }

    fn write(&mut self, id: u8, address: u16, data: &[u8]) -> TxResult {
        let mut params = match self.address_params(address) {
            Ok(params) => params,
            Err(comm) => return TxResult::comm_failure(comm),
        };
        params.extend_from_slice(data);

        match self.txrx(id, Instruction::Write, &params) {
            Ok(status) => TxResult::device_error(status.error),
            Err(comm) => TxResult::comm_failure(comm),
        }
    }
}

impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let port = serialport::new(&self.port_name, self.baudrate)
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn set_baud_rate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.port_name.clone()))?;
        port.set_baud_rate(baudrate)?;
        self.baudrate = baudrate;
        Ok(())
    }

    fn write_1_byte(&mut self, id: u8, address: u16, value: u8) -> TxResult {
        debug!("Write u8 to motor {}: addr={}, value={}", id, address, value);
        self.write(id, address, &[value])
    }

    fn write_4_byte(&mut self, id: u8, address: u16, value: u32) -> TxResult {
        debug!("Write u32 to motor {}: addr={}, value={}", id, address, value);
        self.write(id, address, &value.to_le_bytes())
    }

    fn read_4_byte(&mut self, id: u8, address: u16) -> (u32, TxResult) {
        let mut params = match self.address_params(address) {
            Ok(params) => params,
            Err(comm) => return (0, TxResult::comm_failure(comm)),
        };
        match self.protocol {
            ProtocolVersion::V1 => params.push(4),
            ProtocolVersion::V2 => params.extend_from_slice(&4u16.to_le_bytes()),
        }

        match self.txrx(id, Instruction::Read, &params) {
            Ok(status) if status.params.len() == 4 => {
                let value = u32::from_le_bytes([
                    status.params[0],
                    status.params[1],
                    status.params[2],
                    status.params[3],
                ]);
                (value, TxResult::device_error(status.error))
            }
            // An error status carries no data
            Ok(status) if status.error != 0 => (0, TxResult::device_error(status.error)),
            Ok(_) => (0, TxResult::comm_failure(CommResult::RxCorrupt)),
            Err(comm) => (0, TxResult::comm_failure(comm)),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed port {}", self.port_name);
        }
    }
}
