//! Test-cycle state machine. Setup is split into discrete phases (flash
//! image, bitstream, port open) so the driving loop can observe a stop
//! request between them instead of blocking through the whole multi-second
//! sequence; once set up, each step runs one polling cycle over the enabled
//! subsystem checks.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checks;
use crate::error::HarnessError;
use crate::image;
use crate::protocol::{ProtocolError, RegisterMap};
use crate::report::Reporter;
use crate::runner::{PhasedTask, Step};
use crate::{divider_phase, DioMode, TestSettings};

/// Serial read timeout. Long enough for a full flash burst response, short
/// enough to keep a dead board from stalling a cycle for more than a
/// fraction of the budget.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Baud rate of the board's command UART.
pub const BAUD_RATE: u32 = 115_200;

/// Consecutive polling cycles containing transport faults tolerated before
/// the run gives up on the link.
const MAX_FAULT_STREAK: u32 = 3;

/// External effects the state machine sequences: image programming,
/// bitstream programming and the serial transport. Separated out so the
/// machine can be driven against a bench double.
pub trait BoardIo {
    type Port: Read + Write;

    fn write_flash_image(&mut self, seed: u32) -> Result<(), HarnessError>;
    fn program_bitstream(&mut self) -> Result<(), HarnessError>;
    fn open_port(&mut self, port_name: &str) -> Result<Self::Port, HarnessError>;
}

/// Production [`BoardIo`]: generates the verification image on disk and
/// shells out to Vivado batch scripts next to it.
pub struct VivadoTools {
    work_dir: PathBuf,
}

impl VivadoTools {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn image_path(&self) -> PathBuf {
        self.work_dir.join("random_data.bin")
    }

    fn run_vivado(&self, script: &Path) -> Result<(), HarnessError> {
        if !script.exists() {
            return Err(HarnessError::MissingScript(script.to_owned()));
        }
        info!("Calling {}", script.display());
        let status = Command::new("vivado")
            .args(["-mode", "batch", "-source"])
            .arg(script)
            .status()
            .map_err(|e| HarnessError::ToolLaunch {
                tool: "vivado".to_string(),
                source: e,
            })?;
        if !status.success() {
            return Err(HarnessError::ToolFailed {
                script: script.to_owned(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

impl BoardIo for VivadoTools {
    type Port = Box<dyn serialport::SerialPort>;

    fn write_flash_image(&mut self, seed: u32) -> Result<(), HarnessError> {
        let path = self.image_path();
        image::write_verify_image(&path, seed).map_err(|e| HarnessError::ImageWrite {
            file: path.clone(),
            source: e,
        })?;
        self.run_vivado(&self.work_dir.join("program_qspi.tcl"))
    }

    fn program_bitstream(&mut self) -> Result<(), HarnessError> {
        self.run_vivado(&self.work_dir.join("program_device.tcl"))
    }

    fn open_port(&mut self, port_name: &str) -> Result<Self::Port, HarnessError> {
        serialport::new(port_name, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| HarnessError::PortOpen {
                port: port_name.to_string(),
                source: e,
            })
    }
}

/// Where a run currently stands. Phases advance strictly forward; `Polling`
/// self-loops until the run is stopped or aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    WriteFlashImage,
    ProgramDevice,
    OpenPortAndArmDio,
    Polling,
    Aborted,
}

/// One test run: owns the settings, the verification seed, the random
/// source and, once open, the serial port. Subsystem checks borrow the
/// port for a single call and never retain it.
pub struct TestCycle<B: BoardIo> {
    io: B,
    settings: TestSettings,
    map: RegisterMap,
    report: Reporter,
    phase: CyclePhase,
    port: Option<B::Port>,
    verify_seed: u32,
    rng: StdRng,
    cycle: u64,
    fault_streak: u32,
}

impl<B: BoardIo> TestCycle<B> {
    pub fn new(settings: TestSettings, io: B, report: Reporter) -> Self {
        let map = RegisterMap::new(settings.protocol);
        let mut rng = StdRng::from_entropy();
        let verify_seed = rng.gen();
        Self {
            io,
            map,
            report,
            phase: CyclePhase::WriteFlashImage,
            port: None,
            verify_seed,
            rng,
            cycle: 0,
            fault_streak: 0,
            settings,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Completed polling cycles so far.
    pub fn cycles_run(&self) -> u64 {
        self.cycle
    }

    /// Release the serial port if it is open. Valid in any phase and
    /// idempotent.
    pub fn stop(&mut self) {
        if self.port.take().is_some() {
            info!("Released serial port {}", self.settings.com_port);
        }
    }

    fn abort(&mut self, error: &HarnessError) -> Step {
        self.report.error(error.to_string());
        self.phase = CyclePhase::Aborted;
        Step::Finished
    }

    fn step_write_flash_image(&mut self) -> Step {
        if self.settings.enable_flash_verify {
            self.report.block("Writing QSPI...");
            if let Err(e) = self.io.write_flash_image(self.verify_seed) {
                return self.abort(&e);
            }
        }
        self.phase = CyclePhase::ProgramDevice;
        Step::Pending
    }

    fn step_program_device(&mut self) -> Step {
        self.report.block("Writing FPGA image...");
        if let Err(e) = self.io.program_bitstream() {
            self.report.error("Couldn't program bitstream into the board");
            return self.abort(&e);
        }
        self.phase = CyclePhase::OpenPortAndArmDio;
        Step::Pending
    }

    fn step_open_port(&mut self) -> Step {
        self.report.block(format!(
            "Connecting to board on port {}",
            self.settings.com_port
        ));
        let mut port = match self.io.open_port(&self.settings.com_port) {
            Ok(port) => port,
            Err(e) => return self.abort(&e),
        };

        let divider = self.settings.dio_divider;
        let phase = divider_phase(divider);
        if let Err(e) = checks::start_dio(
            &mut port,
            &self.report,
            &self.map,
            self.settings.dio_mode,
            phase,
            divider,
        ) {
            // Not fatal on its own; a dead link shows up again in polling
            // and runs into the fault budget there.
            self.report.error(format!("DIO start failed: {e}"));
        }
        info!(
            "DIO counter output frequency is set to {} MHz",
            100.0 / (2.0 * (divider as f64 + 1.0))
        );
        info!("DIO readback phase count is set to {phase} / {divider}");

        self.port = Some(port);
        self.phase = CyclePhase::Polling;
        Step::Pending
    }

    fn step_poll(&mut self) -> Step {
        let Some(port) = self.port.as_mut() else {
            self.phase = CyclePhase::Aborted;
            return Step::Finished;
        };

        self.cycle += 1;
        self.report.block(format!("Cycle {}", self.cycle));

        // A check's transport fault is reported and the cycle moves on to
        // the remaining checks; only a persistent streak ends the run.
        fn faulted(report: &Reporter, name: &str, e: &ProtocolError) {
            report.error(format!("{name} check failed: {e}"));
        }

        let settings = &self.settings;
        let report = &self.report;
        let mut faults = 0u32;

        if settings.enable_xadc {
            if let Err(e) = checks::read_xadc(port, report) {
                faulted(report, "XADC", &e);
                faults += 1;
            }
        }
        if settings.enable_flash_id {
            if let Err(e) = checks::flash_read_id(port, report) {
                faulted(report, "Flash ID", &e);
                faults += 1;
            }
        }
        if settings.enable_flash_verify {
            if let Err(e) = checks::flash_verify(port, report, self.verify_seed) {
                faulted(report, "Flash verify", &e);
                faults += 1;
            }
        }
        if settings.enable_uart_echo {
            if let Err(e) = checks::uart_echo(port, report, &mut self.rng) {
                faulted(report, "UART echo", &e);
                faults += 1;
            }
        }
        if settings.enable_dio_test {
            if let Err(e) = checks::check_dio(port, report, &self.map) {
                faulted(report, "DIO", &e);
                faults += 1;
            }
        }
        if settings.enable_mouse {
            if let Err(e) = checks::check_mouse(port, report, &self.map) {
                faulted(report, "Mouse", &e);
                faults += 1;
            }
        }
        if settings.enable_bram_test {
            if let Err(e) = checks::check_bram(
                port,
                report,
                &self.map,
                settings.bram_range.as_ref(),
                &mut self.rng,
            ) {
                faulted(report, "BRAM", &e);
                faults += 1;
            }
        }

        if faults > 0 {
            self.fault_streak += 1;
            if self.fault_streak >= MAX_FAULT_STREAK {
                self.report.error(format!(
                    "Giving up after {MAX_FAULT_STREAK} consecutive cycles with serial faults"
                ));
                self.stop();
                self.phase = CyclePhase::Aborted;
                return Step::Finished;
            }
        } else {
            self.fault_streak = 0;
        }
        Step::CycleDone
    }
}

impl<B: BoardIo> PhasedTask for TestCycle<B> {
    fn setup(&mut self) {
        match self.settings.dio_mode {
            DioMode::ImmunityTopToBottom | DioMode::ImmunityPortPairs => {
                self.report.block("Starting IMMUNITY test sequence");
            }
            DioMode::Emissions => {
                self.report.block("Starting EMISSIONS test sequence");
            }
            DioMode::Off => {
                self.report.block("Starting test sequence with DIO off");
            }
        }
        let s = &self.settings;
        info!("Setting enable_xadc:         {}", s.enable_xadc);
        info!("Setting enable_flash_id:     {}", s.enable_flash_id);
        info!("Setting enable_flash_verify: {}", s.enable_flash_verify);
        info!("Setting enable_uart_echo:    {}", s.enable_uart_echo);
        info!("Setting enable_dio_test:     {}", s.enable_dio_test);
        info!("Setting enable_mouse:        {}", s.enable_mouse);
        info!("Setting enable_bram_test:    {}", s.enable_bram_test);
        info!("Setting dio_mode:            {}", s.dio_mode.label());
        info!("Setting dio_divider:         {}", s.dio_divider);
        info!("Setting com_port:            {}", s.com_port);
    }

    fn step(&mut self) -> Step {
        match self.phase {
            CyclePhase::WriteFlashImage => self.step_write_flash_image(),
            CyclePhase::ProgramDevice => self.step_program_device(),
            CyclePhase::OpenPortAndArmDio => self.step_open_port(),
            CyclePhase::Polling => self.step_poll(),
            CyclePhase::Aborted => Step::Finished,
        }
    }

    fn teardown(&mut self) {
        self.stop();
        self.report.block("Test run stopped");
    }
}
