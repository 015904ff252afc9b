// Device controller for Dynamixel servos on one adapter
//
// Owns the transport session and the set of motors with torque enabled.
// Register failures are reported as diagnostics and never abort the
// operation; only bringing up the connection can fail hard.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::classify::{classify, ConfigStep, Diagnostic};
use super::motion::{self, Reached};
use super::registers::{ControlTable, MotorFamily, OperatingMode, TORQUE_DISABLE, TORQUE_ENABLE};
use crate::config::{ControllerConfig, WaitPolicy};
use crate::transport::{ProtocolVersion, SerialTransport, Transport, TransportError, TxResult};

/// Present position plus homing offset after centering
pub const CENTER_REFERENCE: i32 = 522_239;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Failed to connect on {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: TransportError,
    },

    #[error("Motor {id} did not reach {target} within {elapsed:?} (last position {last_position})")]
    WaitTimeout {
        id: u8,
        target: i32,
        last_position: i32,
        elapsed: Duration,
    },
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Controller for the servos behind one serial adapter
pub struct DeviceController<T: Transport> {
    transport: T,
    family: MotorFamily,
    table: &'static ControlTable,
    mode: OperatingMode,
    threshold: i32,
    homing_offset: Option<i32>,
    wait: WaitPolicy,
    motors: BTreeSet<u8>,
    open: bool,
    diagnostics: Option<Sender<Diagnostic>>,
}

impl DeviceController<SerialTransport> {
    /// Open the serial port named in `config`
    pub fn connect(config: &ControllerConfig) -> Result<Self> {
        let protocol = ProtocolVersion::try_from(config.protocol_version).map_err(|source| {
            ControllerError::Connection {
                port: config.port.clone(),
                source,
            }
        })?;
        Self::open(config, SerialTransport::new(&config.port, protocol))
    }
}

impl<T: Transport> DeviceController<T> {
    /// Open the session and negotiate the baud rate
    pub fn open(config: &ControllerConfig, mut transport: T) -> Result<Self> {
        info!("Opening motor bus on {}", transport.port_name());
        if let Err(source) = transport.open() {
            return Err(ControllerError::Connection {
                port: transport.port_name().to_string(),
                source,
            });
        }
        info!("Port {} open", transport.port_name());

        if let Err(source) = transport.set_baud_rate(config.baudrate) {
            let port = transport.port_name().to_string();
            transport.close();
            return Err(ControllerError::Connection { port, source });
        }
        info!("Baud rate set to {}", config.baudrate);

        Ok(Self {
            transport,
            family: config.family,
            table: config.family.control_table(),
            mode: config.operating_mode,
            threshold: config.moving_threshold,
            homing_offset: config.homing_offset,
            wait: config.wait,
            motors: BTreeSet::new(),
            open: true,
            diagnostics: None,
        })
    }

    /// Receive every diagnostic emitted from now on
    pub fn subscribe_diagnostics(&mut self) -> Receiver<Diagnostic> {
        let (tx, rx) = mpsc::channel();
        self.diagnostics = Some(tx);
        rx
    }

    fn emit(&mut self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        if let Some(tx) = &self.diagnostics {
            if tx.send(diagnostic).is_err() {
                self.diagnostics = None;
            }
        }
    }

    fn check(&self, result: TxResult) -> std::result::Result<(), String> {
        classify(&self.transport, result)
    }

    fn configure_step(&mut self, id: u8, step: ConfigStep, result: TxResult) -> bool {
        match self.check(result) {
            Ok(()) => true,
            Err(detail) => {
                self.emit(Diagnostic::UnreachableMotor { id, step, detail });
                false
            }
        }
    }

    /// Configure a motor and enable its torque.
    ///
    /// Writes the operating mode, then either centers the motor or applies
    /// the configured homing offset, then enables torque. The motor is
    /// registered only if the torque enable succeeds; returns whether it was.
    pub fn add_motor(&mut self, id: u8, center: bool) -> bool {
        info!("Configuring motor {} ({:?}, {:?})", id, self.family, self.mode);

        let result = self
            .transport
            .write_1_byte(id, self.table.operating_mode, self.mode as u8);
        self.configure_step(id, ConfigStep::OperatingMode, result);

        if center {
            self.center(id);
        } else if let Some(offset) = self.homing_offset {
            let result = self
                .transport
                .write_4_byte(id, self.table.homing_offset, offset as u32);
            self.configure_step(id, ConfigStep::HomingOffset, result);
        }

        let result = self
            .transport
            .write_1_byte(id, self.table.torque_enable, TORQUE_ENABLE);
        if self.configure_step(id, ConfigStep::TorqueEnable, result) {
            info!("Motor {} has been successfully connected", id);
            self.motors.insert(id);
            true
        } else {
            false
        }
    }

    /// Pick a homing offset so the current position reads as `CENTER_REFERENCE`.
    ///
    /// The offset lives in EEPROM and survives power cycles, so it is cleared
    /// before reading; otherwise present position would already include it.
    fn center(&mut self, id: u8) {
        let result = self.transport.write_4_byte(id, self.table.homing_offset, 0);
        if !self.configure_step(id, ConfigStep::HomingOffset, result) {
            return;
        }

        let (raw, result) = self.transport.read_4_byte(id, self.table.present_position);
        if !self.configure_step(id, ConfigStep::Centering, result) {
            // No trustworthy position to center on
            return;
        }

        let present = raw as i32;
        let offset = CENTER_REFERENCE.wrapping_sub(present);
        debug!("Centering motor {}: present={}, offset={}", id, present, offset);

        let result = self
            .transport
            .write_4_byte(id, self.table.homing_offset, offset as u32);
        self.configure_step(id, ConfigStep::HomingOffset, result);
    }

    /// Disable torque on a registered motor and forget it
    pub fn remove_motor(&mut self, id: u8) -> bool {
        if !self.motors.remove(&id) {
            return false;
        }
        self.disable_torque(id);
        true
    }

    fn disable_torque(&mut self, id: u8) {
        let result = self
            .transport
            .write_1_byte(id, self.table.torque_enable, TORQUE_DISABLE);
        match self.check(result) {
            Ok(()) => debug!("Torque disabled on motor {}", id),
            Err(detail) => self.emit(Diagnostic::TorqueDisableFailure { id, detail }),
        }
    }

    fn write_goal(&mut self, id: u8, position: i32) {
        debug!("Goal for motor {}: {}", id, position);
        let result = self
            .transport
            .write_4_byte(id, self.table.goal_position, position as u32);
        if let Err(detail) = self.check(result) {
            self.emit(Diagnostic::CommunicationFailure { id, detail });
        }
    }

    /// Write a goal position, optionally blocking until the motor gets there.
    ///
    /// A failed write is only reported; a requested wait still runs.
    pub fn set_goal(&mut self, id: u8, position: i32, block: bool) -> Result<()> {
        self.write_goal(id, position);
        if block {
            self.wait_until_reached(id, position, self.threshold)?;
        }
        Ok(())
    }

    /// Block until motor `id` reports a position within `threshold` of `target`
    pub fn wait_until_reached(&mut self, id: u8, target: i32, threshold: i32) -> Result<Reached> {
        let policy = self.wait;
        motion::wait_until_reached(|| self.position(id), target, threshold, &policy).map_err(|timeout| {
            ControllerError::WaitTimeout {
                id,
                target,
                last_position: timeout.last_position,
                elapsed: timeout.elapsed,
            }
        })
    }

    /// Read present position.
    ///
    /// On failure a diagnostic is emitted and whatever the transport returned
    /// is passed through unchanged, so the value may be meaningless.
    pub fn position(&mut self, id: u8) -> i32 {
        let (raw, result) = self.transport.read_4_byte(id, self.table.present_position);
        if let Err(detail) = self.check(result) {
            self.emit(Diagnostic::ReadFailure { id, detail });
        }
        raw as i32
    }

    pub fn set_homing_offset(&mut self, id: u8, offset: i32) -> bool {
        let result = self
            .transport
            .write_4_byte(id, self.table.homing_offset, offset as u32);
        match self.check(result) {
            Ok(()) => true,
            Err(detail) => {
                self.emit(Diagnostic::HomingFailure { id, detail });
                false
            }
        }
    }

    /// Send the motor back to the origin of the operating mode
    pub fn reset_to_origin(&mut self, id: u8) {
        self.write_goal(id, self.origin_position());
    }

    /// Disable torque on every registered motor and close the port.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn shutdown(&mut self) {
        for id in std::mem::take(&mut self.motors) {
            self.disable_torque(id);
        }
        if self.open {
            self.transport.close();
            self.open = false;
            info!("Closed motor bus on {}", self.transport.port_name());
        }
    }

    pub fn origin_position(&self) -> i32 {
        self.mode.origin_position()
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn operating_mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_registered(&self, id: u8) -> bool {
        self.motors.contains(&id)
    }

    /// Motors with torque enabled, in ascending order
    pub fn registered_ids(&self) -> Vec<u8> {
        self.motors.iter().copied().collect()
    }
}

impl<T: Transport> Drop for DeviceController<T> {
    fn drop(&mut self) {
        // Torque must be off before the port goes away
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CommResult, SimTransport, Transaction};

    fn config(mode: OperatingMode) -> ControllerConfig {
        ControllerConfig {
            port: "sim".to_string(),
            operating_mode: mode,
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_origin_depends_on_mode() {
        let sim = SimTransport::new(MotorFamily::XSeries);
        let ctrl = DeviceController::open(&config(OperatingMode::Position), sim.clone()).unwrap();
        assert_eq!(ctrl.origin_position(), 2033);

        let ctrl = DeviceController::open(&config(OperatingMode::ExtendedPosition), sim).unwrap();
        assert_eq!(ctrl.origin_position(), 0);
    }

    #[test]
    fn test_add_motor_sequence() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 100);
        let mut ctrl = DeviceController::open(&config(OperatingMode::ExtendedPosition), sim.clone()).unwrap();
        sim.clear_log();

        assert!(ctrl.add_motor(1, false));
        assert_eq!(
            sim.transactions(),
            vec![
                Transaction::Write1 { id: 1, address: 11, value: 4 },
                Transaction::Write1 { id: 1, address: 64, value: 1 },
            ]
        );
        assert_eq!(sim.operating_mode(1), Some(4));
        assert_eq!(sim.torque_enabled(1), Some(true));
        assert!(ctrl.is_registered(1));
    }

    #[test]
    fn test_configured_homing_offset_written() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(2, 0);
        let cfg = ControllerConfig {
            homing_offset: Some(-1024),
            ..config(OperatingMode::ExtendedPosition)
        };
        let mut ctrl = DeviceController::open(&cfg, sim.clone()).unwrap();

        assert!(ctrl.add_motor(2, false));
        assert_eq!(sim.homing_offset(2), Some(-1024));
    }

    #[test]
    fn test_failed_mode_write_still_registers() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 0);
        sim.inject_fault(1, 11, CommResult::RxCorrupt);
        let mut ctrl = DeviceController::open(&config(OperatingMode::Position), sim).unwrap();
        let diagnostics = ctrl.subscribe_diagnostics();

        assert!(ctrl.add_motor(1, false));
        let diag = diagnostics.try_recv().unwrap();
        assert!(matches!(
            diag,
            Diagnostic::UnreachableMotor { id: 1, step: ConfigStep::OperatingMode, .. }
        ));
        assert!(diagnostics.try_recv().is_err());
    }

    #[test]
    fn test_centering_skipped_when_read_fails() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 300);
        sim.inject_fault(1, 132, CommResult::RxTimeout);
        let mut ctrl = DeviceController::open(&config(OperatingMode::ExtendedPosition), sim.clone()).unwrap();
        let diagnostics = ctrl.subscribe_diagnostics();

        assert!(ctrl.add_motor(1, true));
        assert_eq!(sim.homing_offset(1), Some(0));
        assert!(matches!(
            diagnostics.try_recv().unwrap(),
            Diagnostic::UnreachableMotor { step: ConfigStep::Centering, .. }
        ));
        // Only the clearing write reaches the homing register
        let homing_writes: Vec<u32> = sim
            .transactions()
            .iter()
            .filter_map(|t| match *t {
                Transaction::Write4 { address: 20, value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(homing_writes, vec![0]);
    }

    #[test]
    fn test_centering_stops_when_offset_cannot_be_cleared() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 300);
        sim.inject_fault(1, 20, CommResult::TxFail);
        let mut ctrl = DeviceController::open(&config(OperatingMode::ExtendedPosition), sim.clone()).unwrap();
        let diagnostics = ctrl.subscribe_diagnostics();
        sim.clear_log();

        assert!(ctrl.add_motor(1, true));
        assert!(matches!(
            diagnostics.try_recv().unwrap(),
            Diagnostic::UnreachableMotor { step: ConfigStep::HomingOffset, .. }
        ));
        assert!(diagnostics.try_recv().is_err());
        assert!(
            !sim.transactions()
                .iter()
                .any(|t| matches!(t, Transaction::Read4 { address: 132, .. }))
        );
    }

    #[test]
    fn test_remove_motor() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 0);
        let mut ctrl = DeviceController::open(&config(OperatingMode::Position), sim.clone()).unwrap();
        ctrl.add_motor(1, false);

        assert!(ctrl.remove_motor(1));
        assert_eq!(sim.torque_enabled(1), Some(false));
        assert!(!ctrl.remove_motor(1));

        sim.clear_log();
        ctrl.shutdown();
        assert_eq!(sim.transactions(), vec![Transaction::Close]);
    }

    #[test]
    fn test_set_homing_offset() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 0);
        let mut ctrl = DeviceController::open(&config(OperatingMode::Position), sim.clone()).unwrap();

        assert!(ctrl.set_homing_offset(1, 77));
        assert_eq!(sim.homing_offset(1), Some(77));
        assert!(!ctrl.set_homing_offset(5, 77));
    }

    #[test]
    fn test_reset_to_origin() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 0);
        let mut ctrl = DeviceController::open(&config(OperatingMode::Position), sim.clone()).unwrap();
        ctrl.add_motor(1, false);

        ctrl.reset_to_origin(1);
        assert_eq!(sim.goal_position(1), Some(2033));
    }

    #[test]
    fn test_wait_deadline_surfaces_as_error() {
        let sim = SimTransport::new(MotorFamily::XSeries).with_motor(1, 0);
        let cfg = ControllerConfig {
            wait: WaitPolicy {
                poll_interval_ms: Some(1),
                deadline_ms: Some(10),
            },
            ..config(OperatingMode::ExtendedPosition)
        };
        let mut ctrl = DeviceController::open(&cfg, sim).unwrap();

        // Torque never enabled, so the motor never moves
        let err = ctrl.set_goal(1, 4000, true).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::WaitTimeout { id: 1, target: 4000, last_position: 0, .. }
        ));
    }

    #[test]
    fn test_baud_failure_closes_port() {
        let sim = SimTransport::new(MotorFamily::XSeries).fail_baud_rate();
        let err = DeviceController::open(&config(OperatingMode::Position), sim.clone()).err();
        assert!(matches!(err, Some(ControllerError::Connection { .. })));
        assert_eq!(
            sim.transactions(),
            vec![Transaction::Open, Transaction::SetBaudRate(57_600), Transaction::Close]
        );
        assert!(!sim.is_open());
    }
}
