// Command-line front end: read, move, watch and jog motors
//
// Every command goes through the public controller API. The controller is
// dropped on every exit path, which disables torque before the port closes.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::thread::sleep;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::ControllerConfig;
use crate::messages::{MoveReport, PositionSample};
use crate::motor::registers::position_to_degrees;
use crate::motor::{DeviceController, Diagnostic, MotorFamily, OperatingMode};
use crate::transport::{SimTransport, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Largest step accepted in jog mode
const MAX_JOG_STEP: i32 = 10_000;

// Per-poll travel of simulated motors
const SIM_STEP: u32 = 200;

#[derive(Debug, Parser)]
#[command(name = "dynamixel-helper", about = "Drive Dynamixel servos through a U2D2 adapter")]
pub struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub port: Option<String>,

    #[arg(short, long, global = true)]
    pub baudrate: Option<u32>,

    #[arg(long, global = true)]
    pub protocol: Option<u8>,

    #[arg(long, value_enum, global = true)]
    pub family: Option<MotorFamily>,

    #[arg(long, value_enum, global = true)]
    pub mode: Option<OperatingMode>,

    /// Moving-status threshold in encoder units
    #[arg(long, global = true)]
    pub threshold: Option<i32>,

    /// Run against a simulated bus instead of a serial port
    #[arg(long, global = true)]
    pub simulate: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read present position once (torque untouched)
    Read {
        #[arg(short, long, default_value_t = 1)]
        id: u8,
    },
    /// Enable a motor and move it to a goal position
    Move {
        #[arg(short, long, default_value_t = 1)]
        id: u8,
        #[arg(allow_hyphen_values = true)]
        position: i32,
        /// Center the motor before moving
        #[arg(long)]
        center: bool,
        /// Return right after writing the goal
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        json: bool,
    },
    /// Poll present position of one or more motors
    Watch {
        #[arg(short, long = "id", default_values_t = [1u8])]
        ids: Vec<u8>,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        /// Stop after this many rounds
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Step a motor interactively: Enter moves one step, a number sets the step
    Jog {
        #[arg(short, long, default_value_t = 4)]
        id: u8,
        #[arg(long, default_value_t = 1)]
        step: i32,
    },
}

impl Command {
    fn motor_ids(&self) -> Vec<u8> {
        match self {
            Command::Read { id } | Command::Move { id, .. } | Command::Jog { id, .. } => vec![*id],
            Command::Watch { ids, .. } => ids.clone(),
        }
    }
}

impl Cli {
    /// Resolve the controller configuration from file and flags
    pub fn controller_config(&self) -> Result<ControllerConfig, BoxError> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(port) = &self.port {
            config.port = port.clone();
        }
        if let Some(baudrate) = self.baudrate {
            config.baudrate = baudrate;
        }
        if let Some(protocol) = self.protocol {
            config.protocol_version = protocol;
        }
        if let Some(family) = self.family {
            config.family = family;
        }
        if let Some(mode) = self.mode {
            config.operating_mode = mode;
        }
        if let Some(threshold) = self.threshold {
            config.moving_threshold = threshold;
        }
        Ok(config)
    }
}

pub fn run(cli: Cli) -> Result<(), BoxError> {
    let config = cli.controller_config()?;
    info!(
        "Config: port={}, protocol={}, baud={}, family={:?}, mode={:?}",
        config.port, config.protocol_version, config.baudrate, config.family, config.operating_mode
    );

    if cli.simulate {
        let sim = cli
            .command
            .motor_ids()
            .into_iter()
            .fold(SimTransport::new(config.family).with_step(SIM_STEP), |sim, id| {
                sim.with_motor(id, 0)
            });
        let mut controller = DeviceController::open(&config, sim)?;
        execute(&mut controller, &cli.command)
    } else {
        let mut controller = DeviceController::connect(&config)?;
        execute(&mut controller, &cli.command)
    }
}

fn execute<T: Transport>(controller: &mut DeviceController<T>, command: &Command) -> Result<(), BoxError> {
    match *command {
        Command::Read { id } => {
            let position = controller.position(id);
            println!("Motor {}: {} ({:.1}°)", id, position, position_to_degrees(position));
            Ok(())
        }
        Command::Move {
            id,
            position,
            center,
            no_wait,
            json,
        } => run_move(controller, id, position, center, !no_wait, json),
        Command::Watch {
            ref ids,
            interval_ms,
            count,
            json,
        } => run_watch(controller, ids, Duration::from_millis(interval_ms), count, json),
        Command::Jog { id, step } => run_jog(controller, id, step),
    }
}

fn run_move<T: Transport>(
    controller: &mut DeviceController<T>,
    id: u8,
    goal: i32,
    center: bool,
    block: bool,
    json: bool,
) -> Result<(), BoxError> {
    if !controller.add_motor(id, center) {
        return Err(format!("Motor {} could not be enabled", id).into());
    }

    println!("Current position {}", controller.position(id));
    controller.set_goal(id, goal, false)?;
    let threshold = controller.threshold();
    let polls = if block {
        Some(controller.wait_until_reached(id, goal, threshold)?.polls)
    } else {
        None
    };

    let report = MoveReport {
        id,
        goal,
        position: controller.position(id),
        polls,
    };
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("Current position {}", report.position);
    }
    Ok(())
}

fn drain_diagnostics(diagnostics: &Receiver<Diagnostic>) -> Result<(), BoxError> {
    while let Ok(diagnostic) = diagnostics.try_recv() {
        println!("{}", serde_json::to_string(&diagnostic)?);
    }
    Ok(())
}

fn run_watch<T: Transport>(
    controller: &mut DeviceController<T>,
    ids: &[u8],
    interval: Duration,
    count: Option<u64>,
    json: bool,
) -> Result<(), BoxError> {
    // Plain output leaves diagnostics to the log, so nothing queues up unread
    let diagnostics = json.then(|| controller.subscribe_diagnostics());
    let started = Instant::now();
    let mut round = 0;

    while count.is_none_or(|count| round < count) {
        for &id in ids {
            let sample = PositionSample::new(id, controller.position(id), started.elapsed().as_millis() as u64);
            if json {
                println!("{}", serde_json::to_string(&sample)?);
                if let Some(diagnostics) = &diagnostics {
                    drain_diagnostics(diagnostics)?;
                }
            } else {
                println!("Motor {}: {} ({:.1}°)", sample.id, sample.position, sample.degrees);
            }
        }
        round += 1;
        sleep(interval);
    }
    Ok(())
}

/// Outcome of one line of jog input
#[derive(Debug, PartialEq, Eq)]
enum JogInput {
    Step,
    SetStep(i32),
    Quit,
    Invalid,
}

fn parse_jog_input(line: &str) -> JogInput {
    let line = line.trim();
    if line.is_empty() {
        return JogInput::Step;
    }
    if line.eq_ignore_ascii_case("q") {
        return JogInput::Quit;
    }
    match line.parse::<i32>() {
        Ok(value) if (-MAX_JOG_STEP..=MAX_JOG_STEP).contains(&value) => JogInput::SetStep(value),
        _ => JogInput::Invalid,
    }
}

fn run_jog<T: Transport>(controller: &mut DeviceController<T>, id: u8, step: i32) -> Result<(), BoxError> {
    if !controller.add_motor(id, true) {
        return Err(format!("Motor {} could not be enabled", id).into());
    }

    let mut step = step;
    let mut target = controller.position(id);
    println!("Motor {} at {}. Enter: step by {}, number: set step, q: quit", id, target, step);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        match parse_jog_input(&line?) {
            JogInput::Step => {
                target += step;
                controller.set_goal(id, target, true)?;
                println!("Moved to {}", target);
            }
            JogInput::SetStep(value) => {
                step = value;
                println!("Step updated to {}", step);
            }
            JogInput::Quit => break,
            JogInput::Invalid => {
                println!("Enter a number between {} and {}.", -MAX_JOG_STEP, MAX_JOG_STEP)
            }
        }
    }
    println!("Exiting...");
    Ok(())
}
