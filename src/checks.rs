//! One check per board subsystem, each a stateless protocol interaction over
//! a borrowed serial transport. A check reports its result lines through a
//! [`Reporter`] and returns a compact [`CheckResult`]; transport-level
//! trouble (timeout, malformed hex) surfaces as a [`ProtocolError`] for the
//! cycle to count against its fault budget.

use std::io::{Read, Write};

use rand::Rng;

use crate::prng::lfsr_next;
use crate::protocol::{self, ProtocolError, Register, RegisterMap};
use crate::report::Reporter;
use crate::{BramRange, DioMode};

/// JEDEC id of the Macronix part populated on the board.
pub const MACRONIX_FLASH_ID: u32 = 0x1620c2;

/// Bytes exchanged by the UART echo check.
pub const ECHO_LEN: usize = 100;

// DIO status word bits.
const DIO_NOT_RUNNING: u32 = 1 << 16;
const DIO_BAD_CONFIG: u32 = 1 << 17;
const DIO_MISMATCH_MASK: u32 = 0xffff;

// PS/2 status word bits.
const MOUSE_FRESH: u32 = 1 << 26;
const MOUSE_NOT_INITIALIZED: u32 = 1 << 25;
const MOUSE_READ_ID_FAILED: u32 = 1 << 24;

// BRAM status word bits.
const BRAM_COMPLETE: u32 = 1 << 1;
const BRAM_PASSED: u32 = 1 << 0;

/// Board subsystem a check exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Xadc,
    FlashId,
    FlashVerify,
    UartEcho,
    Dio,
    Mouse,
    Bram,
}

/// How a single check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    /// The board had no fresh data to judge (mouse idle since last poll).
    Stale,
    /// The board-side test is still running; neither pass nor fail yet.
    Incomplete,
}

/// A named value read off the board, kept alongside the human-readable
/// result for consumers that want numbers rather than text.
#[derive(Debug, Clone)]
pub struct Reading {
    pub label: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub raw: u32,
}

/// Per-subsystem outcome of one poll cycle.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub subsystem: Subsystem,
    pub outcome: Outcome,
    pub detail: String,
    pub readings: Vec<Reading>,
}

impl CheckResult {
    fn new(subsystem: Subsystem, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            subsystem,
            outcome,
            detail: detail.into(),
            readings: Vec::new(),
        }
    }
}

fn xadc_temperature(raw: u32) -> f64 {
    ((raw / 16) as f64 * 503.975) / 4096.0 - 273.15
}

fn xadc_voltage(raw: u32) -> f64 {
    (raw / 16) as f64 / 4096.0 * 3.0
}

/// Dump the XADC channels: die temperature plus the three supply rails.
/// Values are reported, never asserted against a threshold.
pub fn read_xadc<T: Read + Write>(
    port: &mut T,
    report: &Reporter,
) -> Result<CheckResult, ProtocolError> {
    const CHANNELS: [(&str, &str); 4] = [
        ("XSM_CH_TEMP", "degrees C"),
        ("XSM_CH_VCCINT", "V"),
        ("XSM_CH_VCCAUX", "V"),
        ("XSM_CH_VBRAM", "V"),
    ];

    protocol::command(port, b'x')?;
    let mut readings = Vec::with_capacity(CHANNELS.len());
    for (i, &(label, unit)) in CHANNELS.iter().enumerate() {
        let raw = protocol::read_hex(port, 4)?;
        let value = if i == 0 {
            xadc_temperature(raw)
        } else {
            xadc_voltage(raw)
        };
        report.info(format!("{label}:  {value:.4} {unit} ({raw:04x})"));
        readings.push(Reading {
            label,
            value,
            unit,
            raw,
        });
    }

    let mut result = CheckResult::new(Subsystem::Xadc, Outcome::Pass, "");
    result.readings = readings;
    Ok(result)
}

/// Read the SPI flash JEDEC id and compare against the expected part.
pub fn flash_read_id<T: Read + Write>(
    port: &mut T,
    report: &Reporter,
) -> Result<CheckResult, ProtocolError> {
    protocol::command(port, b'f')?;
    let id = protocol::read_hex(port, 6)?;
    if id != MACRONIX_FLASH_ID {
        let detail = format!("Flash read ID failed: Unexpected flash ID of {id:#x}");
        report.error(&detail);
        return Ok(CheckResult::new(Subsystem::FlashId, Outcome::Fail, detail));
    }
    let detail = format!("Flash read ID succeeded: Macronix flash ID ({id:#x}) detected");
    report.info(&detail);
    Ok(CheckResult::new(Subsystem::FlashId, Outcome::Pass, detail))
}

/// Ask the board to re-read the flash and compare against the LFSR sequence
/// for `seed`. The board reports the verdict; the expected first word is
/// recomputed locally so an operator can confirm the sequence independently.
pub fn flash_verify<T: Read + Write>(
    port: &mut T,
    report: &Reporter,
    seed: u32,
) -> Result<CheckResult, ProtocolError> {
    protocol::command(port, b'q')?;
    protocol::send_hex(port, seed, 8)?;
    port.flush().map_err(ProtocolError::Io)?;

    let verdict = protocol::read_hex(port, 1)?;
    let error_count = protocol::read_hex(port, 8)?;
    let first = protocol::read_hex(port, 8)?;
    let last = protocol::read_hex(port, 8)?;

    let mut result;
    if verdict != 0 {
        let detail = format!(
            "Flash read failed: Contents did not match expectation, \
             error_count={error_count}, first={first:#010x}, last={last:#010x} \
             (expected first word {:#010x})",
            lfsr_next(seed)
        );
        report.error(&detail);
        result = CheckResult::new(Subsystem::FlashVerify, Outcome::Fail, detail);
    } else {
        let detail =
            format!("Flash read passed, first value seen: {first:#010x}, last: {last:#010x}");
        report.info(&detail);
        result = CheckResult::new(Subsystem::FlashVerify, Outcome::Pass, detail);
    }
    result.readings = vec![
        Reading {
            label: "error_count",
            value: error_count as f64,
            unit: "words",
            raw: error_count,
        },
        Reading {
            label: "first_word",
            value: first as f64,
            unit: "",
            raw: first,
        },
        Reading {
            label: "last_word",
            value: last as f64,
            unit: "",
            raw: last,
        },
    ];
    Ok(result)
}

/// Push random bytes through the board's UART loopback and compare the echo
/// byte-for-byte.
pub fn uart_echo<T: Read + Write, R: Rng>(
    port: &mut T,
    report: &Reporter,
    rng: &mut R,
) -> Result<CheckResult, ProtocolError> {
    let mut payload = [0u8; ECHO_LEN];
    for byte in payload.iter_mut() {
        *byte = rng.gen_range(0..128);
    }

    protocol::command(port, b'e')?;
    protocol::send_hex(port, ECHO_LEN as u32, 2)?;
    port.write_all(&payload).map_err(ProtocolError::Io)?;
    port.flush().map_err(ProtocolError::Io)?;

    let mut echo = [0u8; ECHO_LEN];
    protocol::read_bytes(port, &mut echo)?;

    if let Some(i) = (0..ECHO_LEN).find(|&i| echo[i] != payload[i]) {
        let detail = format!(
            "Echo test failed: Mismatch in echoed data at position {i}, {} != {}",
            echo[i], payload[i]
        );
        report.error(&detail);
        return Ok(CheckResult::new(Subsystem::UartEcho, Outcome::Fail, detail));
    }
    report.info("Echo test passed");
    Ok(CheckResult::new(
        Subsystem::UartEcho,
        Outcome::Pass,
        "Echo test passed",
    ))
}

/// Read and clear the DIO status word: running flag, configuration flag and
/// the per-channel mismatch mask accumulated since the previous read.
pub fn check_dio<T: Read + Write>(
    port: &mut T,
    report: &Reporter,
    map: &RegisterMap,
) -> Result<CheckResult, ProtocolError> {
    let status = protocol::read_register(port, map, Register::DioStatus)?;
    let mut problems = Vec::new();

    if status & DIO_NOT_RUNNING != 0 {
        report.error("DIO not running");
        problems.push("not running".to_string());
    } else {
        report.info("DIO counters are running");
    }

    if status & DIO_BAD_CONFIG != 0 {
        report.error("Invalid DIO phase/divider configuration - check setup");
        problems.push("invalid phase/divider configuration".to_string());
    }

    let mismatches = status & DIO_MISMATCH_MASK;
    if mismatches != 0 {
        report.error(format!(
            "Invalid DIO bits detected ({mismatches:#06x}) since the last read"
        ));
        problems.push(format!("mismatch bits {mismatches:#06x}"));
    } else {
        report.info("All DIO samples match");
    }

    let mut result = if problems.is_empty() {
        CheckResult::new(Subsystem::Dio, Outcome::Pass, "All DIO samples match")
    } else {
        CheckResult::new(Subsystem::Dio, Outcome::Fail, problems.join("; "))
    };
    result.readings = vec![Reading {
        label: "mismatch_mask",
        value: mismatches as f64,
        unit: "",
        raw: mismatches,
    }];
    Ok(result)
}

/// Pack mode, phase and divider into the DIO settings word.
pub fn compose_dio_settings(mode: DioMode, phase: u8, divider: u8) -> u32 {
    ((mode as u32 & 0x3) << 16) | ((phase as u32) << 8) | divider as u32
}

/// Write the DIO settings word and immediately read the status back to
/// confirm the counters came up.
pub fn start_dio<T: Read + Write>(
    port: &mut T,
    report: &Reporter,
    map: &RegisterMap,
    mode: DioMode,
    phase: u8,
    divider: u8,
) -> Result<CheckResult, ProtocolError> {
    let settings = compose_dio_settings(mode, phase, divider);
    report.info(format!("DIO settings word: {settings:#010x}"));
    protocol::write_register(port, map, Register::DioSettings, settings)?;
    check_dio(port, report, map)
}

/// Poll the PS/2 mouse status word. Without fresh data there is nothing to
/// judge, so the error bits are only evaluated when bit 26 is set.
pub fn check_mouse<T: Read + Write>(
    port: &mut T,
    report: &Reporter,
    map: &RegisterMap,
) -> Result<CheckResult, ProtocolError> {
    let status = protocol::read_register(port, map, Register::Ps2Pos)?;

    if status & MOUSE_FRESH == 0 {
        report.info("Mouse data is stale");
        return Ok(CheckResult::new(
            Subsystem::Mouse,
            Outcome::Stale,
            "Mouse data is stale",
        ));
    }
    report.info("New status received from mouse");

    let mut problems = Vec::new();
    if status & MOUSE_NOT_INITIALIZED != 0 {
        report.error("Mouse not initialized");
        problems.push("not initialized");
    }
    if status & MOUSE_READ_ID_FAILED != 0 {
        report.error("Mouse read ID failed, possible disconnect");
        problems.push("read ID failed");
    }

    let y = (status >> 12) & 0xfff;
    let x = status & 0xfff;
    report.info(format!("Mouse position: Y={y}; X={x}"));

    let mut result = if problems.is_empty() {
        CheckResult::new(
            Subsystem::Mouse,
            Outcome::Pass,
            format!("Mouse position: Y={y}; X={x}"),
        )
    } else {
        CheckResult::new(Subsystem::Mouse, Outcome::Fail, problems.join("; "))
    };
    result.readings = vec![
        Reading {
            label: "pos_x",
            value: x as f64,
            unit: "counts",
            raw: x,
        },
        Reading {
            label: "pos_y",
            value: y as f64,
            unit: "counts",
            raw: y,
        },
    ];
    Ok(result)
}

/// Pack the BRAM address-range word for revision 2 boards: bit 31 selects
/// both banks, bits 24-30 carry the pass count, the low bits the last
/// address to exercise.
pub fn compose_bram_range(range: &BramRange) -> u32 {
    ((range.both_banks as u32) << 31)
        | ((range.passes as u32 & 0x7f) << 24)
        | (range.max_address & 0x00ff_ffff)
}

/// Seed the BRAM self-test and read its status word. An unfinished test is
/// a warning, not a failure; the pass bit only means anything once the
/// complete bit is set.
pub fn check_bram<T: Read + Write, R: Rng>(
    port: &mut T,
    report: &Reporter,
    map: &RegisterMap,
    range: Option<&BramRange>,
    rng: &mut R,
) -> Result<CheckResult, ProtocolError> {
    let seed: u32 = rng.gen();
    protocol::write_register(port, map, Register::BramSeed, seed)?;

    if let Some(range) = range {
        if map.offset(Register::BramAddrMax).is_some() {
            protocol::write_register(port, map, Register::BramAddrMax, compose_bram_range(range))?;
        }
    }

    let status = protocol::read_register(port, map, Register::BramStatus)?;
    if status & BRAM_COMPLETE != 0 {
        if status & BRAM_PASSED != 0 {
            report.info("BRAM test passed");
            return Ok(CheckResult::new(
                Subsystem::Bram,
                Outcome::Pass,
                "BRAM test passed",
            ));
        }
        report.error("BRAM test failed");
        return Ok(CheckResult::new(
            Subsystem::Bram,
            Outcome::Fail,
            "BRAM test failed",
        ));
    }
    report.warn("BRAM test not complete");
    Ok(CheckResult::new(
        Subsystem::Bram,
        Outcome::Incomplete,
        "BRAM test not complete",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolRev;
    use crate::testutil::MockPort;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rev1() -> RegisterMap {
        RegisterMap::new(ProtocolRev::Rev1)
    }

    // --- XADC ---

    #[test]
    fn xadc_sends_x_and_converts_all_channels() {
        // 0x9773 / 16 = 2423 -> roughly 25 degrees; 0x6000 / 16 = 1536 ->
        // 1.125 V on the voltage scale.
        let mut port = MockPort::scripted(&["9773", "6000", "6000", "6000"]);
        let result = read_xadc(&mut port, &Reporter::detached()).unwrap();

        assert_eq!(port.written_bytes(), b"x");
        assert_eq!(result.outcome, Outcome::Pass);
        assert_eq!(result.readings.len(), 4);
        let temp = result.readings[0].value;
        assert!((24.0..26.0).contains(&temp), "temp was {temp}");
        for reading in &result.readings[1..] {
            assert!((reading.value - 1.125).abs() < 1e-9);
        }
    }

    #[test]
    fn xadc_conversion_uses_integer_truncation() {
        // The low nibble is dropped before scaling, so 0x600f converts the
        // same as 0x6000.
        assert_eq!(xadc_voltage(0x600f), xadc_voltage(0x6000));
        assert_eq!(xadc_temperature(0x977f), xadc_temperature(0x9770));
    }

    // --- Flash ---

    #[test]
    fn flash_id_passes_on_the_macronix_part() {
        let mut port = MockPort::scripted(&["1620c2"]);
        let result = flash_read_id(&mut port, &Reporter::detached()).unwrap();
        assert_eq!(port.written_bytes(), b"f");
        assert_eq!(result.outcome, Outcome::Pass);
    }

    #[test]
    fn flash_id_failure_names_the_observed_id() {
        let mut port = MockPort::scripted(&["000000"]);
        let result = flash_read_id(&mut port, &Reporter::detached()).unwrap();
        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.detail.contains("0x0"), "detail: {}", result.detail);
    }

    #[test]
    fn flash_verify_sends_seed_and_parses_verdict_fields() {
        let mut port = MockPort::scripted(&["0", "00000000", "2468acf1", "00c0ffee"]);
        let result = flash_verify(&mut port, &Reporter::detached(), 0x12345678).unwrap();

        assert_eq!(port.written_bytes(), b"q12345678");
        assert_eq!(result.outcome, Outcome::Pass);
        assert_eq!(result.readings[1].raw, 0x2468acf1);
        assert_eq!(result.readings[2].raw, 0x00c0ffee);
    }

    #[test]
    fn flash_verify_failure_reports_count_and_expected_word() {
        let mut port = MockPort::scripted(&["1", "0000002a", "deadbeef", "00000000"]);
        let seed = 0x1234_5678;
        let result = flash_verify(&mut port, &Reporter::detached(), seed).unwrap();

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.detail.contains("error_count=42"));
        let expected = format!("{:#010x}", lfsr_next(seed));
        assert!(
            result.detail.contains(&expected),
            "detail should name {expected}: {}",
            result.detail
        );
    }

    // --- UART echo ---

    fn echo_payload(seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..ECHO_LEN).map(|_| rng.gen_range(0..128)).collect()
    }

    #[test]
    fn echo_passes_when_the_board_returns_the_payload() {
        let payload = echo_payload(7);
        let mut port = MockPort::new();
        port.push_bytes(&payload);

        let mut rng = StdRng::seed_from_u64(7);
        let result = uart_echo(&mut port, &Reporter::detached(), &mut rng).unwrap();

        assert_eq!(result.outcome, Outcome::Pass);
        let written = port.written_bytes();
        assert_eq!(&written[..3], b"e64");
        assert_eq!(&written[3..], &payload[..]);
    }

    #[test]
    fn echo_reports_the_first_mismatch_position() {
        let mut corrupted = echo_payload(7);
        corrupted[5] ^= 0x40;
        let mut port = MockPort::new();
        port.push_bytes(&corrupted);

        let mut rng = StdRng::seed_from_u64(7);
        let result = uart_echo(&mut port, &Reporter::detached(), &mut rng).unwrap();

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(
            result.detail.contains("position 5"),
            "detail: {}",
            result.detail
        );
    }

    #[test]
    fn echo_payload_stays_below_128() {
        let payload = echo_payload(99);
        assert!(payload.iter().all(|&b| b < 128));
    }

    // --- DIO ---

    #[test]
    fn dio_settings_word_packs_mode_phase_divider() {
        let word = compose_dio_settings(DioMode::ImmunityPortPairs, 1, 3);
        assert_eq!(word, 0x020103);
    }

    #[test]
    fn dio_clean_status_passes() {
        let mut port = MockPort::scripted(&["00000000"]);
        let result = check_dio(&mut port, &Reporter::detached(), &rev1()).unwrap();
        assert_eq!(port.written_bytes(), b"r10");
        assert_eq!(result.outcome, Outcome::Pass);
    }

    #[test]
    fn dio_not_running_bit_fails_the_check() {
        let mut port = MockPort::scripted(&["00010000"]);
        let result = check_dio(&mut port, &Reporter::detached(), &rev1()).unwrap();
        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.detail.contains("not running"));
    }

    #[test]
    fn dio_mismatch_bits_fail_and_name_the_mask() {
        let mut port = MockPort::scripted(&["00020005"]);
        let result = check_dio(&mut port, &Reporter::detached(), &rev1()).unwrap();
        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.detail.contains("invalid phase/divider"));
        assert!(result.detail.contains("0x0005"));
        assert_eq!(result.readings[0].raw, 0x0005);
    }

    #[test]
    fn start_dio_writes_settings_then_reads_status() {
        let mut port = MockPort::scripted(&["00000000"]);
        let result = start_dio(
            &mut port,
            &Reporter::detached(),
            &rev1(),
            DioMode::ImmunityPortPairs,
            1,
            3,
        )
        .unwrap();
        assert_eq!(port.written_bytes(), b"w0c00020103r10");
        assert_eq!(result.outcome, Outcome::Pass);
    }

    // --- Mouse ---

    #[test]
    fn stale_mouse_short_circuits() {
        let mut port = MockPort::scripted(&["00000000"]);
        let result = check_mouse(&mut port, &Reporter::detached(), &rev1()).unwrap();
        assert_eq!(port.written_bytes(), b"r14");
        assert_eq!(result.outcome, Outcome::Stale);
        assert!(result.readings.is_empty());
    }

    #[test]
    fn fresh_mouse_reports_position() {
        // bit 26 set, Y = 0x123, X = 0x456.
        let status = (1u32 << 26) | (0x123 << 12) | 0x456;
        let response = format!("{status:08x}");
        let mut port = MockPort::scripted(&[response.as_str()]);
        let result = check_mouse(&mut port, &Reporter::detached(), &rev1()).unwrap();

        assert_eq!(result.outcome, Outcome::Pass);
        assert_eq!(result.readings[0].raw, 0x456);
        assert_eq!(result.readings[1].raw, 0x123);
    }

    #[test]
    fn uninitialized_mouse_fails_even_with_position() {
        let status = (1u32 << 26) | (1 << 25);
        let response = format!("{status:08x}");
        let mut port = MockPort::scripted(&[response.as_str()]);
        let result = check_mouse(&mut port, &Reporter::detached(), &rev1()).unwrap();
        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.detail.contains("not initialized"));
    }

    // --- BRAM ---

    #[test]
    fn bram_triage_follows_complete_and_pass_bits() {
        let cases = [
            ("00000003", Outcome::Pass),
            ("00000002", Outcome::Fail),
            ("00000000", Outcome::Incomplete),
        ];
        for (response, expected) in cases {
            let mut port = MockPort::scripted(&[response]);
            let mut rng = StdRng::seed_from_u64(1);
            let result = check_bram(
                &mut port,
                &Reporter::detached(),
                &rev1(),
                None,
                &mut rng,
            )
            .unwrap();
            assert_eq!(result.outcome, expected, "response {response}");
        }
    }

    #[test]
    fn bram_rev1_writes_seed_then_reads_status_at_28() {
        let mut port = MockPort::scripted(&["00000003"]);
        let mut rng = StdRng::seed_from_u64(1);
        let seed: u32 = StdRng::seed_from_u64(1).gen();
        check_bram(&mut port, &Reporter::detached(), &rev1(), None, &mut rng).unwrap();

        let expected = format!("w18{seed:08x}r1c");
        assert_eq!(port.written_bytes(), expected.as_bytes());
    }

    #[test]
    fn bram_rev2_writes_range_word_and_reads_status_at_32() {
        let map = RegisterMap::new(ProtocolRev::Rev2);
        let range = BramRange {
            max_address: 0x1234,
            both_banks: true,
            passes: 2,
        };
        let mut port = MockPort::scripted(&["00000003"]);
        let mut rng = StdRng::seed_from_u64(1);
        let seed: u32 = StdRng::seed_from_u64(1).gen();
        check_bram(&mut port, &Reporter::detached(), &map, Some(&range), &mut rng).unwrap();

        let range_word = compose_bram_range(&range);
        assert_eq!(range_word, 0x8200_1234);
        let expected = format!("w18{seed:08x}w1c{range_word:08x}r20");
        assert_eq!(port.written_bytes(), expected.as_bytes());
    }

    #[test]
    fn bram_range_on_rev1_is_skipped() {
        let range = BramRange::default();
        let mut port = MockPort::scripted(&["00000003"]);
        let mut rng = StdRng::seed_from_u64(1);
        check_bram(&mut port, &Reporter::detached(), &rev1(), Some(&range), &mut rng).unwrap();
        let written = port.written_bytes();
        // seed write + status read only, no second 'w' frame
        assert_eq!(written.iter().filter(|&&b| b == b'w').count(), 1);
        assert!(written.ends_with(b"r1c"));
    }
}
