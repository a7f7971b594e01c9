//! Status fan-out. Every result line a run produces goes to the `log`
//! facade, and, when a display is attached, to a channel of [`StatusLine`]s
//! the operator console renders. Block-marker lines tell the console where
//! one retained block of output ends and the next begins.

use std::sync::mpsc::Sender;

use log::Level;

/// Display role of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Normal,
    /// Starts a new retained block in the console (cycle and phase
    /// boundaries, end of run).
    BlockStart,
}

/// One leveled record mirrored to the display.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub level: Level,
    pub kind: LineKind,
    pub text: String,
}

/// Writes result lines to the log and, when attached, to the display
/// channel. Cloned freely; a send to a disappeared display is dropped
/// without complaint.
#[derive(Clone)]
pub struct Reporter {
    tx: Option<Sender<StatusLine>>,
}

impl Reporter {
    pub fn new(tx: Sender<StatusLine>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Log-only reporter, for headless use and tests.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    fn push(&self, level: Level, kind: LineKind, text: String) {
        log::log!(level, "{text}");
        if let Some(tx) = &self.tx {
            let text = match level {
                Level::Error => format!("[ERROR] {text}"),
                Level::Warn => format!("[WARNING] {text}"),
                _ => text,
            };
            let _ = tx.send(StatusLine { level, kind, text });
        }
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(Level::Info, LineKind::Normal, text.into());
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.push(Level::Warn, LineKind::Normal, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(Level::Error, LineKind::Normal, text.into());
    }

    /// Info-level line that also opens a new display block.
    pub fn block(&self, text: impl Into<String>) {
        self.push(Level::Info, LineKind::BlockStart, text.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn lines_carry_level_kind_and_prefix() {
        let (tx, rx) = mpsc::channel();
        let reporter = Reporter::new(tx);

        reporter.block("Cycle 1");
        reporter.info("All DIO samples match");
        reporter.warn("BRAM test not complete");
        reporter.error("DIO not running");

        let lines: Vec<StatusLine> = rx.try_iter().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].kind, LineKind::BlockStart);
        assert_eq!(lines[0].text, "Cycle 1");
        assert_eq!(lines[1].kind, LineKind::Normal);
        assert_eq!(lines[2].text, "[WARNING] BRAM test not complete");
        assert_eq!(lines[3].level, Level::Error);
        assert_eq!(lines[3].text, "[ERROR] DIO not running");
    }

    #[test]
    fn detached_reporter_accepts_lines() {
        let reporter = Reporter::detached();
        reporter.info("no display attached");
        reporter.error("still fine");
    }

    #[test]
    fn dropped_display_does_not_poison_the_reporter() {
        let (tx, rx) = mpsc::channel();
        let reporter = Reporter::new(tx);
        drop(rx);
        reporter.info("display went away");
    }
}
