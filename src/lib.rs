//! # Basys-3 Validation Harness Library
//!
//! This library contains the core logic for exercising a Basys-3 class
//! development board over its serial command interface. It programs the
//! board's flash and bitstream through the external Vivado toolchain, then
//! polls the board once a second to check each hardware subsystem: the XADC
//! analog monitor, SPI flash identification and verification, a UART echo
//! loopback, the DIO toggle counters used for EMI testing, the PS/2 mouse
//! interface and the BRAM self-test.

pub mod checks;
pub mod cycle;
pub mod error;
pub mod image;
pub mod prng;
pub mod protocol;
pub mod report;
pub mod runner;

pub use checks::{CheckResult, Outcome, Subsystem};
pub use cycle::{BoardIo, CyclePhase, TestCycle, VivadoTools};
pub use error::HarnessError;
pub use protocol::{ProtocolError, ProtocolRev, Register, RegisterMap};
pub use report::{LineKind, Reporter, StatusLine};
pub use runner::{CancelToken, PhasedTask, Step, TestRunner};

/// DIO toggle pattern selected for a run. The discriminants are the mode
/// field of the DIO settings word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DioMode {
    Off = 0,
    ImmunityTopToBottom = 1,
    ImmunityPortPairs = 2,
    Emissions = 3,
}

impl DioMode {
    pub fn label(self) -> &'static str {
        match self {
            DioMode::Off => "DIO_MODE_OFF",
            DioMode::ImmunityTopToBottom => "DIO_MODE_IMMUNITY_TOP_TO_BOTTOM",
            DioMode::ImmunityPortPairs => "DIO_MODE_IMMUNITY_PORT_PAIRS",
            DioMode::Emissions => "DIO_MODE_EMISSIONS",
        }
    }

    /// The next mode in presentation order, wrapping around.
    pub fn cycled(self) -> Self {
        match self {
            DioMode::Off => DioMode::ImmunityTopToBottom,
            DioMode::ImmunityTopToBottom => DioMode::ImmunityPortPairs,
            DioMode::ImmunityPortPairs => DioMode::Emissions,
            DioMode::Emissions => DioMode::Off,
        }
    }
}

/// BRAM address-range configuration, honored by protocol revision 2 boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BramRange {
    pub max_address: u32,
    pub both_banks: bool,
    pub passes: u8,
}

impl Default for BramRange {
    fn default() -> Self {
        Self {
            max_address: 0xffff,
            both_banks: false,
            passes: 1,
        }
    }
}

/// Operator-chosen configuration for one test run. Built once from the
/// console state when a run starts and immutable for the run's duration.
#[derive(Debug, Clone)]
pub struct TestSettings {
    pub com_port: String,
    pub enable_xadc: bool,
    pub enable_flash_id: bool,
    pub enable_flash_verify: bool,
    pub enable_uart_echo: bool,
    pub enable_dio_test: bool,
    pub enable_mouse: bool,
    pub enable_bram_test: bool,
    pub dio_mode: DioMode,
    // Both the divider and the phase derived from it are single bytes on the
    // wire; u8 here keeps them in range by construction.
    pub dio_divider: u8,
    pub protocol: ProtocolRev,
    pub bram_range: Option<BramRange>,
}

impl TestSettings {
    /// All checks enabled, DIO off, divider 4: the defaults the operator
    /// console starts from.
    pub fn new(com_port: impl Into<String>) -> Self {
        Self {
            com_port: com_port.into(),
            enable_xadc: true,
            enable_flash_id: true,
            enable_flash_verify: true,
            enable_uart_echo: true,
            enable_dio_test: true,
            enable_mouse: true,
            enable_bram_test: true,
            dio_mode: DioMode::Off,
            dio_divider: 4,
            protocol: ProtocolRev::Rev1,
            bram_range: None,
        }
    }
}

/// Readback phase count matching a DIO divider: `(divider + 1) / 2 - 1`,
/// wrapped to a byte exactly as the settings word encoding wraps it. A
/// divider of 0 therefore yields 255, which the board rejects as an invalid
/// configuration through DIO status bit 17.
pub fn divider_phase(divider: u8) -> u8 {
    (((divider as u16 + 1) / 2).wrapping_sub(1) & 0xff) as u8
}
