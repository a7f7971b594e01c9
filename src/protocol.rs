//! Wire codec for the board's memory-mapped register interface. Commands and
//! responses are ASCII hex with no delimiters and fixed field widths; the
//! named single-character operations (`'x'`, `'f'`, `'q'`, `'e'`) share the
//! same framing. Register offsets differ between firmware revisions, so the
//! register map is a versioned table rather than bare constants.

use std::io::{self, Read, Write};

/// Firmware protocol revision. Rev2 boards grew a BRAM address-range
/// register at offset 28 and moved BRAM status up to 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRev {
    Rev1,
    Rev2,
}

/// Logical registers exposed over the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    DioSettings,
    DioStatus,
    Ps2Pos,
    BramSeed,
    BramAddrMax,
    BramStatus,
}

/// Revision-resolved register table: logical register to byte offset and
/// hex field width.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    rev: ProtocolRev,
}

impl RegisterMap {
    pub fn new(rev: ProtocolRev) -> Self {
        Self { rev }
    }

    pub fn rev(&self) -> ProtocolRev {
        self.rev
    }

    /// Byte offset of `reg` in this revision, or `None` where the revision
    /// does not expose it.
    pub fn offset(&self, reg: Register) -> Option<u8> {
        match (reg, self.rev) {
            (Register::DioSettings, _) => Some(12),
            (Register::DioStatus, _) => Some(16),
            (Register::Ps2Pos, _) => Some(20),
            (Register::BramSeed, _) => Some(24),
            (Register::BramAddrMax, ProtocolRev::Rev1) => None,
            (Register::BramAddrMax, ProtocolRev::Rev2) => Some(28),
            (Register::BramStatus, ProtocolRev::Rev1) => Some(28),
            (Register::BramStatus, ProtocolRev::Rev2) => Some(32),
        }
    }

    /// Hex digits in the register's value field. Every mapped register is a
    /// full 32-bit word.
    pub fn width(&self, _reg: Register) -> usize {
        8
    }
}

// Errors raised while talking to the board.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// No data arrived before the port's read timeout elapsed.
    #[error("timed out waiting for {wanted} byte(s) from the board")]
    Timeout { wanted: usize },
    /// The port closed mid-field.
    #[error("short read, port closed before {wanted} byte(s) arrived")]
    ShortRead { wanted: usize },
    /// A response field was not parseable hexadecimal.
    #[error("malformed hex field {field:?} in board response")]
    BadHex { field: String },
    /// The register is not present in the active protocol revision.
    #[error("register {0:?} is not present in this protocol revision")]
    MissingRegister(Register),
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

fn bad_hex(field: &[u8]) -> ProtocolError {
    ProtocolError::BadHex {
        field: String::from_utf8_lossy(field).into_owned(),
    }
}

/// Fill `buf` from the port, classifying timeouts and truncation so the
/// enclosing check fails instead of seeing a partial value.
pub fn read_bytes<T: Read>(port: &mut T, buf: &mut [u8]) -> Result<(), ProtocolError> {
    port.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProtocolError::Timeout {
            wanted: buf.len(),
        },
        io::ErrorKind::UnexpectedEof => ProtocolError::ShortRead { wanted: buf.len() },
        _ => ProtocolError::Io(e),
    })
}

/// Read an exact-width hex field and parse it as an unsigned integer.
pub fn read_hex<T: Read>(port: &mut T, digits: usize) -> Result<u32, ProtocolError> {
    let mut buf = vec![0u8; digits];
    read_bytes(port, &mut buf)?;
    let text = std::str::from_utf8(&buf).map_err(|_| bad_hex(&buf))?;
    u32::from_str_radix(text, 16).map_err(|_| bad_hex(&buf))
}

/// Send a value as `digits` lowercase hex characters, zero-padded and masked
/// to the field width.
pub fn send_hex<T: Write>(port: &mut T, value: u32, digits: usize) -> Result<(), ProtocolError> {
    let mask = (1u64 << (4 * digits as u64)) - 1;
    let field = format!("{:0digits$x}", value as u64 & mask, digits = digits);
    port.write_all(field.as_bytes())?;
    Ok(())
}

/// Send a bare single-character operation.
pub fn command<T: Write>(port: &mut T, op: u8) -> Result<(), ProtocolError> {
    port.write_all(&[op])?;
    port.flush()?;
    Ok(())
}

/// `'w'` + 2-digit offset + full-width value.
pub fn write_register<T: Write>(
    port: &mut T,
    map: &RegisterMap,
    reg: Register,
    value: u32,
) -> Result<(), ProtocolError> {
    let offset = map.offset(reg).ok_or(ProtocolError::MissingRegister(reg))?;
    port.write_all(b"w")?;
    send_hex(port, offset as u32, 2)?;
    send_hex(port, value, map.width(reg))?;
    port.flush()?;
    Ok(())
}

/// `'r'` + 2-digit offset, then read the register's full-width value back.
pub fn read_register<T: Read + Write>(
    port: &mut T,
    map: &RegisterMap,
    reg: Register,
) -> Result<u32, ProtocolError> {
    let offset = map.offset(reg).ok_or(ProtocolError::MissingRegister(reg))?;
    port.write_all(b"r")?;
    send_hex(port, offset as u32, 2)?;
    port.flush()?;
    read_hex(port, map.width(reg))
}
