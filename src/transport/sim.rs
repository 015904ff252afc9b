// In-memory servo bus for tests and dry runs
//
// Motors follow the control table of one family. Present position is
// reported as raw + homing offset, EEPROM registers refuse writes while
// torque is on, and every transaction is recorded in order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CommResult, ProtocolVersion, Transport, TransportError, TxResult};
use crate::motor::{ControlTable, MotorFamily};

/// Device error: access violation (protocol 2.0 error number 7)
const ACCESS_ERROR: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Open,
    SetBaudRate(u32),
    Write1 { id: u8, address: u16, value: u8 },
    Write4 { id: u8, address: u16, value: u32 },
    Read4 { id: u8, address: u16 },
    Close,
}

#[derive(Debug, Default)]
struct SimMotor {
    raw: i32,
    goal: i32,
    homing_offset: i32,
    torque: bool,
    mode: u8,
}

impl SimMotor {
    fn present(&self) -> i32 {
        self.raw.wrapping_add(self.homing_offset)
    }

    /// Advance one poll toward the goal
    fn step(&mut self, units: Option<u32>) {
        if !self.torque {
            return;
        }
        let target = self.goal.wrapping_sub(self.homing_offset);
        let delta = target.saturating_sub(self.raw);
        self.raw += match units {
            None => delta,
            Some(units) => delta.clamp(-(units as i32), units as i32),
        };
    }
}

struct SimBus {
    table: ControlTable,
    motors: HashMap<u8, SimMotor>,
    scripted: HashMap<u8, VecDeque<i32>>,
    faults: HashMap<(u8, u16), CommResult>,
    step: Option<u32>,
    fail_open: bool,
    fail_baud: bool,
    is_open: bool,
    log: Vec<Transaction>,
}

/// Simulated bus; clones share the same state
#[derive(Clone)]
pub struct SimTransport {
    port_name: String,
    protocol: ProtocolVersion,
    bus: Arc<Mutex<SimBus>>,
}

impl SimTransport {
    pub fn new(family: MotorFamily) -> Self {
        Self {
            port_name: "sim".to_string(),
            protocol: ProtocolVersion::V2,
            bus: Arc::new(Mutex::new(SimBus {
                table: *family.control_table(),
                motors: HashMap::new(),
                scripted: HashMap::new(),
                faults: HashMap::new(),
                step: None,
                fail_open: false,
                fail_baud: false,
                is_open: false,
                log: Vec::new(),
            })),
        }
    }

    fn bus(&self) -> MutexGuard<'_, SimBus> {
        self.bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a motor reporting `present` as its current position
    pub fn with_motor(self, id: u8, present: i32) -> Self {
        self.bus().motors.insert(
            id,
            SimMotor {
                raw: present,
                goal: present,
                ..SimMotor::default()
            },
        );
        self
    }

    /// Limit how far a motor moves per present-position read
    pub fn with_step(self, units: u32) -> Self {
        self.bus().step = Some(units);
        self
    }

    pub fn fail_open(self) -> Self {
        self.bus().fail_open = true;
        self
    }

    pub fn fail_baud_rate(self) -> Self {
        self.bus().fail_baud = true;
        self
    }

    /// Make every transaction on `address` of motor `id` fail with `comm`
    pub fn inject_fault(&self, id: u8, address: u16, comm: CommResult) {
        self.bus().faults.insert((id, address), comm);
    }

    pub fn clear_faults(&self) {
        self.bus().faults.clear();
    }

    /// Queue present-position values returned before the motion model resumes
    pub fn script_positions(&self, id: u8, positions: impl IntoIterator<Item = i32>) {
        self.bus().scripted.entry(id).or_default().extend(positions);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.bus().log.clone()
    }

    pub fn clear_log(&self) {
        self.bus().log.clear();
    }

    pub fn is_open(&self) -> bool {
        self.bus().is_open
    }

    pub fn torque_enabled(&self, id: u8) -> Option<bool> {
        self.bus().motors.get(&id).map(|m| m.torque)
    }

    pub fn operating_mode(&self, id: u8) -> Option<u8> {
        self.bus().motors.get(&id).map(|m| m.mode)
    }

    pub fn homing_offset(&self, id: u8) -> Option<i32> {
        self.bus().motors.get(&id).map(|m| m.homing_offset)
    }

    pub fn goal_position(&self, id: u8) -> Option<i32> {
        self.bus().motors.get(&id).map(|m| m.goal)
    }

    pub fn present_position(&self, id: u8) -> Option<i32> {
        self.bus().motors.get(&id).map(|m| m.present())
    }
}

impl SimBus {
    fn precheck(&self, id: u8, address: u16) -> Option<TxResult> {
        if !self.is_open {
            return Some(TxResult::comm_failure(CommResult::TxFail));
        }
        if let Some(&comm) = self.faults.get(&(id, address)) {
            return Some(TxResult::comm_failure(comm));
        }
        if !self.motors.contains_key(&id) {
            return Some(TxResult::comm_failure(CommResult::RxTimeout));
        }
        None
    }

    fn write(&mut self, id: u8, address: u16, value: u32) -> TxResult {
        if let Some(result) = self.precheck(id, address) {
            return result;
        }
        let table = self.table;
        let Some(motor) = self.motors.get_mut(&id) else {
            return TxResult::comm_failure(CommResult::RxTimeout);
        };

        if address == table.torque_enable {
            motor.torque = value != 0;
        } else if address == table.goal_position {
            motor.goal = value as i32;
        } else if address == table.homing_offset {
            if motor.torque {
                return TxResult::device_error(ACCESS_ERROR);
            }
            // Goal is in present-position terms, so it moves with the offset
            let offset = value as i32;
            motor.goal = motor.goal.wrapping_add(offset.wrapping_sub(motor.homing_offset));
            motor.homing_offset = offset;
        } else if address == table.operating_mode {
            if motor.torque {
                return TxResult::device_error(ACCESS_ERROR);
            }
            motor.mode = value as u8;
        }
        TxResult::OK
    }

    fn read(&mut self, id: u8, address: u16) -> (u32, TxResult) {
        if let Some(result) = self.precheck(id, address) {
            return (0, result);
        }
        let table = self.table;
        let step = self.step;
        let scripted = &mut self.scripted;
        let Some(motor) = self.motors.get_mut(&id) else {
            return (0, TxResult::comm_failure(CommResult::RxTimeout));
        };

        let value = if address == table.present_position {
            match scripted.get_mut(&id).and_then(|queue| queue.pop_front()) {
                Some(present) => {
                    motor.raw = present.wrapping_sub(motor.homing_offset);
                    present
                }
                None => {
                    motor.step(step);
                    motor.present()
                }
            }
        } else if address == table.goal_position {
            motor.goal
        } else if address == table.homing_offset {
            motor.homing_offset
        } else {
            0
        };
        (value as u32, TxResult::OK)
    }
}

impl Transport for SimTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus();
        bus.log.push(Transaction::Open);
        if bus.fail_open {
            return Err(TransportError::Unavailable(self.port_name.clone()));
        }
        bus.is_open = true;
        Ok(())
    }

    fn set_baud_rate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        let mut bus = self.bus();
        bus.log.push(Transaction::SetBaudRate(baudrate));
        if bus.fail_baud {
            return Err(TransportError::Unavailable(self.port_name.clone()));
        }
        Ok(())
    }

    fn write_1_byte(&mut self, id: u8, address: u16, value: u8) -> TxResult {
        let mut bus = self.bus();
        bus.log.push(Transaction::Write1 { id, address, value });
        bus.write(id, address, value as u32)
    }

    fn write_4_byte(&mut self, id: u8, address: u16, value: u32) -> TxResult {
        let mut bus = self.bus();
        bus.log.push(Transaction::Write4 { id, address, value });
        bus.write(id, address, value)
    }

    fn read_4_byte(&mut self, id: u8, address: u16) -> (u32, TxResult) {
        let mut bus = self.bus();
        bus.log.push(Transaction::Read4 { id, address });
        bus.read(id, address)
    }

    fn close(&mut self) {
        let mut bus = self.bus();
        bus.log.push(Transaction::Close);
        bus.is_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_sim() -> SimTransport {
        let mut sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 1000);
        sim.open().unwrap();
        sim
    }

    #[test]
    fn test_closed_bus_rejects_transactions() {
        let mut sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 0);
        assert_eq!(sim.write_1_byte(1, 64, 1).comm, CommResult::TxFail);
    }

    #[test]
    fn test_unknown_motor_times_out() {
        let mut sim = open_sim();
        let (_, result) = sim.read_4_byte(9, 132);
        assert_eq!(result.comm, CommResult::RxTimeout);
    }

    #[test]
    fn test_motion_requires_torque() {
        let mut sim = open_sim().with_step(100);
        assert!(sim.write_4_byte(1, 116, 1500).is_success());
        assert_eq!(sim.read_4_byte(1, 132).0, 1000);

        assert!(sim.write_1_byte(1, 64, 1).is_success());
        assert_eq!(sim.read_4_byte(1, 132).0, 1100);
        assert_eq!(sim.read_4_byte(1, 132).0, 1200);
    }

    #[test]
    fn test_eeprom_locked_while_torque_on() {
        let mut sim = open_sim();
        assert!(sim.write_1_byte(1, 64, 1).is_success());
        assert_eq!(sim.write_1_byte(1, 11, 4), TxResult::device_error(ACCESS_ERROR));
        assert_eq!(sim.write_4_byte(1, 20, 5), TxResult::device_error(ACCESS_ERROR));
        assert_eq!(sim.operating_mode(1), Some(0));
    }

    #[test]
    fn test_homing_offset_shifts_present() {
        let mut sim = open_sim();
        assert!(sim.write_4_byte(1, 20, (-500i32) as u32).is_success());
        assert_eq!(sim.read_4_byte(1, 132).0 as i32, 500);
    }

    #[test]
    fn test_scripted_positions_then_model() {
        let mut sim = open_sim();
        sim.script_positions(1, [10, 20]);
        assert_eq!(sim.read_4_byte(1, 132).0, 10);
        assert_eq!(sim.read_4_byte(1, 132).0, 20);
        assert_eq!(sim.read_4_byte(1, 132).0, 20);
    }

    #[test]
    fn test_injected_fault() {
        let mut sim = open_sim();
        sim.inject_fault(1, 116, CommResult::RxCorrupt);
        assert_eq!(sim.write_4_byte(1, 116, 3).comm, CommResult::RxCorrupt);
        sim.clear_faults();
        assert!(sim.write_4_byte(1, 116, 3).is_success());
    }
}
